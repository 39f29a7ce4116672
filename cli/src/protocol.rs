//! Line protocol read from stdin by `safewalk monitor`.
//!
//! One command per line, whitespace separated:
//!
//! ```text
//! pos LAT LON [ACC]     feed a position fix
//! dest LAT LON          choose a destination
//! pass PASSWORD         answer the open challenge
//! dismiss               dismiss the open challenge
//! override              stop deviation checks for this route
//! setpass PASSWORD      register the challenge password
//! address [TEXT]        report the emergency address, or fetch it
//! snapshot              print the session state
//! quit
//! ```

use safewalk_types::{Coordinate, CoordinateError, LatLon, Position, Secret};
use thiserror::Error;

/// Accuracy recorded for fixes entered without one.
const DEFAULT_ACCURACY_M: f64 = 0.0;

#[derive(Debug)]
pub enum Input {
    Position(Position),
    Destination(LatLon),
    Answer(Secret),
    Dismiss,
    Override,
    SetPassword(Secret),
    Address(Option<String>),
    Snapshot,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error(
        "unknown command `{0}` (pos, dest, pass, dismiss, override, setpass, address, snapshot, quit)"
    )]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("`{0}` is not a number")]
    NotANumber(String),
    #[error("rejected fix: {0}")]
    InvalidFix(#[from] CoordinateError),
    #[error("rejected fix: accuracy must be a non-negative number of meters, got {0}")]
    InvalidAccuracy(f64),
}

/// Parse one line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Input>, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(command, rest)| (command, rest.trim()));

    let input = match command {
        "pos" => Input::Position(parse_position(rest)?),
        "dest" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            let [lat, lon] = args.as_slice() else {
                return Err(ProtocolError::Usage("dest LAT LON"));
            };
            Input::Destination(LatLon::new(number(lat)?, number(lon)?))
        }
        "pass" => Input::Answer(required_secret(rest, "pass PASSWORD")?),
        "setpass" => Input::SetPassword(required_secret(rest, "setpass PASSWORD")?),
        "dismiss" => Input::Dismiss,
        "override" => Input::Override,
        "address" => Input::Address((!rest.is_empty()).then(|| rest.to_string())),
        "snapshot" => Input::Snapshot,
        "quit" | "exit" => Input::Quit,
        other => return Err(ProtocolError::UnknownCommand(other.to_string())),
    };
    Ok(Some(input))
}

/// `LAT,LON` as taken by `--from` and `--to`.
pub fn parse_lat_lon(value: &str) -> Result<LatLon, ProtocolError> {
    let (lat, lon) = value
        .split_once(',')
        .ok_or(ProtocolError::Usage("LAT,LON"))?;
    Ok(LatLon::new(number(lat)?, number(lon)?))
}

fn parse_position(rest: &str) -> Result<Position, ProtocolError> {
    let args: Vec<&str> = rest.split_whitespace().collect();
    let (lat, lon, accuracy) = match args.as_slice() {
        [lat, lon] => (lat, lon, None),
        [lat, lon, accuracy] => (lat, lon, Some(accuracy)),
        _ => return Err(ProtocolError::Usage("pos LAT LON [ACC]")),
    };
    let coordinate = Coordinate::new(number(lat)?, number(lon)?)?;
    let accuracy_m = accuracy.map_or(Ok(DEFAULT_ACCURACY_M), |a| number(a))?;
    if !accuracy_m.is_finite() || accuracy_m < 0.0 {
        return Err(ProtocolError::InvalidAccuracy(accuracy_m));
    }
    Ok(Position::now(coordinate, accuracy_m))
}

fn number(raw: &str) -> Result<f64, ProtocolError> {
    raw.trim()
        .parse()
        .map_err(|_| ProtocolError::NotANumber(raw.trim().to_string()))
}

fn required_secret(rest: &str, usage: &'static str) -> Result<Secret, ProtocolError> {
    if rest.is_empty() {
        return Err(ProtocolError::Usage(usage));
    }
    Ok(Secret::new(rest))
}
