use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process start, before the stored credential has been checked.
    Initializing,
    Unauthenticated,
    /// Credentials valid and the user snapshot hydrated.
    Authenticated,
}

impl SessionState {
    pub fn is_loading(self) -> bool {
        self == Self::Initializing
    }

    pub fn is_authenticated(self) -> bool {
        self == Self::Authenticated
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
        };
        f.write_str(s)
    }
}
