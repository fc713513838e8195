//! HTTP handlers: object verbs and multipart actions, bucket statistics and
//! health probes.

pub mod bucket_handlers;
pub mod health_handlers;
pub mod object_handlers;

pub(crate) fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
