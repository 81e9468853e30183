//! Activation failure taxonomy.
//!
//! Causes originate from the radio collaborator; the supervisor only
//! classifies them. Numeric codes follow 3GPP TS 24.008 §10.5.6.6
//! (SM cause).

use std::fmt;

use serde::Serialize;

/// Why a packet-context activation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailCause {
    /// #8: operator determined barring.
    OperatorBarred,
    /// #26: network congestion.
    InsufficientResources,
    /// #27: unknown APN. Also reported when the catalog has no usable APN.
    MissingUnknownApn,
    /// #28: unknown PDP address or type.
    UnknownPdpAddress,
    /// #29: authentication failed.
    UserAuthentication,
    /// #30: rejected by the GGSN / PGW.
    ActivationRejectGgsn,
    /// #31: rejected, unspecified.
    ActivationRejectUnspecified,
    /// #32
    ServiceOptionNotSupported,
    /// #33
    ServiceOptionNotSubscribed,
    /// #34
    ServiceOptionOutOfOrder,
    /// #35
    NsapiInUse,
    /// #111
    ProtocolErrors,
    RegistrationFail,
    GprsRegistrationFail,
    RadioNotAvailable,
    /// Every slot in the pool is busy.
    NoFreeSlot,
    Unknown,
}

impl FailCause {
    /// Map an SM cause code to a `FailCause`. Unlisted codes are `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            8 => FailCause::OperatorBarred,
            26 => FailCause::InsufficientResources,
            27 => FailCause::MissingUnknownApn,
            28 => FailCause::UnknownPdpAddress,
            29 => FailCause::UserAuthentication,
            30 => FailCause::ActivationRejectGgsn,
            31 => FailCause::ActivationRejectUnspecified,
            32 => FailCause::ServiceOptionNotSupported,
            33 => FailCause::ServiceOptionNotSubscribed,
            34 => FailCause::ServiceOptionOutOfOrder,
            35 => FailCause::NsapiInUse,
            111 => FailCause::ProtocolErrors,
            _ => FailCause::Unknown,
        }
    }

    /// SM cause code, if the cause has one.
    pub fn code(&self) -> Option<u32> {
        match self {
            FailCause::OperatorBarred => Some(8),
            FailCause::InsufficientResources => Some(26),
            FailCause::MissingUnknownApn => Some(27),
            FailCause::UnknownPdpAddress => Some(28),
            FailCause::UserAuthentication => Some(29),
            FailCause::ActivationRejectGgsn => Some(30),
            FailCause::ActivationRejectUnspecified => Some(31),
            FailCause::ServiceOptionNotSupported => Some(32),
            FailCause::ServiceOptionNotSubscribed => Some(33),
            FailCause::ServiceOptionOutOfOrder => Some(34),
            FailCause::NsapiInUse => Some(35),
            FailCause::ProtocolErrors => Some(111),
            _ => None,
        }
    }

    /// Retrying the same capability cannot succeed.
    pub fn is_permanent_fail(&self) -> bool {
        matches!(
            self,
            FailCause::OperatorBarred
                | FailCause::MissingUnknownApn
                | FailCause::UnknownPdpAddress
                | FailCause::UserAuthentication
                | FailCause::ActivationRejectGgsn
                | FailCause::ActivationRejectUnspecified
                | FailCause::ServiceOptionNotSupported
                | FailCause::ServiceOptionNotSubscribed
                | FailCause::NsapiInUse
                | FailCause::ProtocolErrors
        )
    }

    /// Network-reported causes worth a structured log record.
    pub fn is_event_loggable(&self) -> bool {
        matches!(
            self,
            FailCause::OperatorBarred
                | FailCause::InsufficientResources
                | FailCause::UnknownPdpAddress
                | FailCause::UserAuthentication
                | FailCause::ActivationRejectGgsn
                | FailCause::ActivationRejectUnspecified
                | FailCause::ServiceOptionNotSubscribed
                | FailCause::ServiceOptionNotSupported
                | FailCause::ServiceOptionOutOfOrder
                | FailCause::NsapiInUse
                | FailCause::ProtocolErrors
        )
    }
}

impl fmt::Display for FailCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailCause::OperatorBarred => "operator determined barring",
            FailCause::InsufficientResources => "insufficient resources",
            FailCause::MissingUnknownApn => "missing or unknown APN",
            FailCause::UnknownPdpAddress => "unknown PDP address or type",
            FailCause::UserAuthentication => "user authentication failed",
            FailCause::ActivationRejectGgsn => "activation rejected by gateway",
            FailCause::ActivationRejectUnspecified => "activation rejected",
            FailCause::ServiceOptionNotSupported => "service option not supported",
            FailCause::ServiceOptionNotSubscribed => "service option not subscribed",
            FailCause::ServiceOptionOutOfOrder => "service option temporarily out of order",
            FailCause::NsapiInUse => "NSAPI already used",
            FailCause::ProtocolErrors => "protocol error",
            FailCause::RegistrationFail => "registration failed",
            FailCause::GprsRegistrationFail => "packet service registration failed",
            FailCause::RadioNotAvailable => "radio not available",
            FailCause::NoFreeSlot => "no free packet context",
            FailCause::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_for_network_causes() {
        for code in [8, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 111] {
            assert_eq!(FailCause::from_code(code).code(), Some(code));
        }
        assert_eq!(FailCause::from_code(200), FailCause::Unknown);
    }

    #[test]
    fn congestion_is_transient_and_loggable() {
        let c = FailCause::InsufficientResources;
        assert!(!c.is_permanent_fail());
        assert!(c.is_event_loggable());
    }

    #[test]
    fn auth_failure_is_permanent() {
        assert!(FailCause::UserAuthentication.is_permanent_fail());
        assert!(FailCause::MissingUnknownApn.is_permanent_fail());
        assert!(!FailCause::Unknown.is_permanent_fail());
        assert!(!FailCause::Unknown.is_event_loggable());
        assert!(!FailCause::RadioNotAvailable.is_permanent_fail());
    }
}
