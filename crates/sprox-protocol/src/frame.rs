//! Messages carried inside frames

use serde::{Deserialize, Serialize};
use sprox_core::{Error, Push, Request, Response};

/// A proxy request, with a sequence number when the sender awaits a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub request: Request,
}

impl Envelope {
    pub fn send(request: Request) -> Self {
        Self { seq: None, request }
    }

    pub fn call(seq: u64, request: Request) -> Self {
        Self {
            seq: Some(seq),
            request,
        }
    }
}

/// Result of a round-trip request as seen on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Ok(Response),
    Err { code: String, message: String },
}

impl Outcome {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Err {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Convert back into the proxy-side result
    pub fn into_result(self) -> sprox_core::Result<Response> {
        match self {
            Outcome::Ok(response) => Ok(response),
            Outcome::Err { code, message } => Err(Error::Rejected { code, message }),
        }
    }
}

impl From<&Error> for Outcome {
    fn from(err: &Error) -> Self {
        let code = match err {
            Error::InvalidProxyId(_) | Error::InvalidStoreKind(_) => "INVALID_ID",
            Error::KindMismatch { .. } => "KIND_MISMATCH",
            Error::UnknownProxy(_) => "NOT_FOUND",
            Error::MalformedUpdate { .. } | Error::MissingEntityId | Error::MissingKeys(_) => {
                "INVALID_DATA"
            }
            Error::Unsupported { .. } => "UNSUPPORTED",
            Error::Rejected { code, .. } => code.as_str(),
            _ => "INTERNAL",
        };
        Outcome::error(code, err.to_string())
    }
}

/// Messages the host sends to a proxy context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostMessage {
    Reply { seq: u64, outcome: Outcome },
    Push(Push),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sprox_core::{ProxyId, StoreKind, StoreRef};

    #[test]
    fn test_fire_and_forget_has_no_seq() {
        let store = StoreRef::new(ProxyId::new("arc:items").unwrap(), StoreKind::Collection);
        let value = serde_json::to_value(Envelope::send(Request::AttachListener { store })).unwrap();
        assert!(value.get("seq").is_none());
        assert_eq!(value["request"]["type"], "attachListener");
        assert_eq!(value["request"]["store"]["kind"], "collection");
    }

    #[test]
    fn test_outcome_maps_to_rejection() {
        let outcome = Outcome::from(&Error::UnknownProxy("arc:x".into()));
        assert!(matches!(&outcome, Outcome::Err { code, .. } if code == "NOT_FOUND"));
        assert!(matches!(
            outcome.into_result(),
            Err(Error::Rejected { code, .. }) if code == "NOT_FOUND"
        ));

        let ok = Outcome::Ok(Response::Value(Some(json!({"id": "a"}))));
        assert_eq!(ok.into_result().unwrap(), Response::Value(Some(json!({"id": "a"}))));
    }

    #[test]
    fn test_rejection_code_is_preserved() {
        let err = Error::Rejected {
            code: "STORE".into(),
            message: "boom".into(),
        };
        assert!(matches!(Outcome::from(&err), Outcome::Err { code, .. } if code == "STORE"));
    }
}
