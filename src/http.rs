use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY_BYTES: u64 = 16 * 1024;

pub(crate) fn agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .timeout_write(WRITE_TIMEOUT)
            .user_agent(concat!("realvoice-rs/", env!("CARGO_PKG_VERSION")))
            .build()
    })
}

/// Pulls the human-readable message out of an error response body.
///
/// Servers in this crate answer with `{"error": ..}` or `{"message": ..}`; anything
/// else is returned verbatim (truncated).
pub(crate) fn error_message(response: ureq::Response) -> String {
    let mut body = String::new();
    if response
        .into_reader()
        .take(MAX_ERROR_BODY_BYTES)
        .read_to_string(&mut body)
        .is_err()
    {
        return String::new();
    }
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or(body),
        Err(_) => body.trim().to_string(),
    }
}
