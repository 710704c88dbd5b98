//! Projects a DID document from the latest non-null directory operation for
//! a subject. Projection is a pure function of that one JSON value.

use serde::Serialize;
use serde_json::Value;

use crate::error::PlcError;

const DID_CONTEXT: &[&str] = &[
    "https://www.w3.org/ns/did/v1",
    "https://w3id.org/security/multikey/v1",
    "https://w3id.org/security/suites/secp256k1-2019/v1",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub controller: String,
    #[serde(rename = "publicKeyMultibase")]
    pub public_key_multibase: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "serviceEndpoint")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "alsoKnownAs")]
    pub also_known_as: Vec<String>,
    #[serde(rename = "verificationMethod")]
    pub verification_method: Vec<VerificationMethod>,
    pub service: Vec<ServiceEntry>,
}

/// Project a DID document from `subject`'s latest operation, stored as
/// canonical JSON.
pub fn project(subject: &str, operation_json: &str) -> Result<DidDocument, PlcError> {
    let op: Value = serde_json::from_str(operation_json)?;
    let fail = |reason: &str| PlcError::Projection {
        subject: subject.to_string(),
        reason: reason.to_string(),
    };

    let also_known_as = match op.get("alsoKnownAs") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| fail("alsoKnownAs contains a non-string entry"))?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(fail("alsoKnownAs is not an array")),
    };

    let mut service = Vec::new();
    if let Some(services) = op.get("services") {
        let services = services
            .as_object()
            .ok_or_else(|| fail("services is not an object"))?;
        for (key, entry) in services {
            let kind = entry
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| fail("service entry missing type"))?;
            let endpoint = entry
                .get("endpoint")
                .and_then(Value::as_str)
                .ok_or_else(|| fail("service entry missing endpoint"))?;
            service.push(ServiceEntry {
                id: format!("#{}", key),
                kind: kind.to_string(),
                endpoint: endpoint.to_string(),
            });
        }
    }

    let mut verification_method = Vec::new();
    if let Some(methods) = op.get("verificationMethods") {
        let methods = methods
            .as_object()
            .ok_or_else(|| fail("verificationMethods is not an object"))?;
        for (key, value) in methods {
            let raw = value
                .as_str()
                .ok_or_else(|| fail("verification method value is not a string"))?;
            let public_key_multibase = raw.strip_prefix("did:key:").unwrap_or(raw).to_string();
            verification_method.push(VerificationMethod {
                id: format!("{}#{}", subject, key),
                kind: "Multikey".to_string(),
                controller: subject.to_string(),
                public_key_multibase,
            });
        }
    }

    Ok(DidDocument {
        context: DID_CONTEXT.iter().map(|s| s.to_string()).collect(),
        id: subject.to_string(),
        also_known_as,
        verification_method,
        service,
    })
}

/// Derive the display handle from an operation's `alsoKnownAs`, stripping
/// the `at://` scheme from the first entry.
pub fn derive_handle(operation_json: &str) -> Option<String> {
    let op: Value = serde_json::from_str(operation_json).ok()?;
    op.get("alsoKnownAs")?
        .as_array()?
        .first()?
        .as_str()
        .map(|s| s.strip_prefix("at://").unwrap_or(s).to_string())
}

/// Derive the atproto PDS endpoint from an operation's `services` map.
pub fn derive_pds_endpoint(operation_json: &str) -> Option<String> {
    let op: Value = serde_json::from_str(operation_json).ok()?;
    op.get("services")?
        .get("atproto_pds")?
        .get("endpoint")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_op() -> String {
        serde_json::json!({
            "type": "plc_operation",
            "alsoKnownAs": ["at://alice.test"],
            "services": {
                "atproto_pds": {
                    "type": "AtprotoPersonalDataServer",
                    "endpoint": "https://pds.example"
                }
            },
            "verificationMethods": {
                "atproto": "did:key:zQ3abc"
            }
        })
        .to_string()
    }

    #[test]
    fn test_project_full_document() {
        let doc = project("did:plc:abc", &sample_op()).unwrap();
        assert_eq!(doc.id, "did:plc:abc");
        assert_eq!(doc.also_known_as, vec!["at://alice.test"]);
        assert_eq!(doc.service.len(), 1);
        assert_eq!(doc.service[0].id, "#atproto_pds");
        assert_eq!(doc.service[0].endpoint, "https://pds.example");
        assert_eq!(doc.verification_method.len(), 1);
        assert_eq!(doc.verification_method[0].id, "did:plc:abc#atproto");
        assert_eq!(doc.verification_method[0].public_key_multibase, "zQ3abc");
    }

    #[test]
    fn test_project_missing_optional_fields() {
        let doc = project("did:plc:abc", "{}").unwrap();
        assert!(doc.also_known_as.is_empty());
        assert!(doc.service.is_empty());
        assert!(doc.verification_method.is_empty());
    }

    #[test]
    fn test_project_rejects_non_array_also_known_as() {
        let op = serde_json::json!({"alsoKnownAs": "not-an-array"}).to_string();
        assert!(project("did:plc:abc", &op).is_err());
    }

    #[test]
    fn test_project_is_pure() {
        let op = sample_op();
        let a = project("did:plc:abc", &op).unwrap();
        let b = project("did:plc:abc", &op).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_handle_strips_scheme() {
        assert_eq!(derive_handle(&sample_op()).as_deref(), Some("alice.test"));
    }

    #[test]
    fn test_derive_pds_endpoint() {
        assert_eq!(
            derive_pds_endpoint(&sample_op()).as_deref(),
            Some("https://pds.example")
        );
    }

    #[test]
    fn test_derive_handle_missing() {
        assert_eq!(derive_handle("{}"), None);
    }
}
