use serde_json::Value;

/// Seam for the external schema converter that turns chat-dialect bodies
/// into native inner requests. The gateway routes and logs; it does not
/// understand foreign dialects itself.
pub trait RequestTranslator: Send + Sync {
    fn to_upstream(&self, body: &Value) -> Result<Value, String>;
}

/// Default translator: accepts bodies that already carry a native
/// `contents` request and strips the routing-only fields. Deployments
/// that speak a foreign chat dialect plug a real converter in here.
pub struct PassthroughTranslator;

impl RequestTranslator for PassthroughTranslator {
    fn to_upstream(&self, body: &Value) -> Result<Value, String> {
        if body.get("contents").is_none() {
            return Err(
                "request body has no 'contents'; a schema converter for this dialect is not configured"
                    .to_string(),
            );
        }
        let mut inner = body.clone();
        if let Some(obj) = inner.as_object_mut() {
            obj.remove("model");
            obj.remove("stream");
        }
        Ok(inner)
    }
}
