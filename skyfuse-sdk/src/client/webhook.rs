//! Webhook signature verification helper for subscribers.

use crate::objects::ChangeEventEnvelope;
use crate::signature::{SignatureError, SignedObject};

/// Verify and deserialize an incoming skyfuse webhook.
///
/// * `signature_header` – value of the `Skyfuse-Signature` request header.
/// * `body` – raw JSON request body string.
/// * `secret` – the endpoint secret registered with skyfuse.
///
/// Deliveries are at-least-once; deduplicate on `event_id` if needed.
pub fn verify_webhook(
    signature_header: &str,
    body: &str,
    secret: &[u8],
) -> Result<ChangeEventEnvelope, SignatureError> {
    SignedObject::<ChangeEventEnvelope>::from_header_and_body(signature_header, body.to_owned())?
        .verify(secret)
}
