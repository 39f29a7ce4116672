use serde::Serialize;

/// Deviation status of the active route, as shown to the person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum DeviationState {
    /// On route, or an off-route excursion has been acknowledged.
    #[default]
    Nominal,
    /// Off route; a challenge is about to start. Only observed transiently.
    Deviated,
    /// A challenge is pending.
    Challenged,
    /// Monitoring suspended for this route by the person.
    Overridden,
}

impl DeviationState {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Deviated => "deviated",
            Self::Challenged => "challenged",
            Self::Overridden => "overridden",
        }
    }
}
