use core::fmt::{self, Display, Formatter};

#[repr(C, u16)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    HelpMessage = 214,
    ServiceReady = 220,
    GoodBye = 221,
    AuthSuccessful = 235,
    Ok = 250,
    CannotVerify = 252,
    AuthChallenge = 334,
    StartMailInput = 354,
    Unavailable = 421,
    ActionAborted = 451,
    TlsUnavailable = 454,
    CommandUnrecognized = 500,
    SyntaxError = 501,
    InvalidCommandSequence = 503,
    NotImplemented = 504,
    AuthRequired = 530,
    AuthFailed = 535,
    EncryptionRequired = 538,
    Error = 550,
    ExceededStorage = 552,
    Failed = 554,
    Unknown(u16),
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        u16::from(self) >= 400 && u16::from(self) < 500
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccessful,
            250 => Self::Ok,
            252 => Self::CannotVerify,
            334 => Self::AuthChallenge,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionAborted,
            454 => Self::TlsUnavailable,
            500 => Self::CommandUnrecognized,
            501 => Self::SyntaxError,
            503 => Self::InvalidCommandSequence,
            504 => Self::NotImplemented,
            530 => Self::AuthRequired,
            535 => Self::AuthFailed,
            538 => Self::EncryptionRequired,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            554 => Self::Failed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        match value {
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::AuthChallenge => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionAborted => 451,
            Status::TlsUnavailable => 454,
            Status::CommandUnrecognized => 500,
            Status::SyntaxError => 501,
            Status::InvalidCommandSequence => 503,
            Status::NotImplemented => 504,
            Status::AuthRequired => 530,
            Status::AuthFailed => 535,
            Status::EncryptionRequired => 538,
            Status::Error => 550,
            Status::ExceededStorage => 552,
            Status::Failed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn status() {
        assert!(Status::Error.is_permanent());
        assert!(!Status::Error.is_temporary());

        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());

        assert_eq!(Status::from(550), Status::Error);
        assert_eq!(u16::from(Status::Error), 550);
        assert_eq!(Status::from(538), Status::EncryptionRequired);
        assert_eq!(Status::from(452), Status::Unknown(452));
        assert_eq!(Status::Failed.to_string(), "554");
    }
}
