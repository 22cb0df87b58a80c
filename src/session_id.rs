use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::Utc;

/// Identifies one control channel lifetime in logs.
///
/// Formatted as `<process start, base 36>-<attempt>`, e.g. `m2x9k1qz-3`, so
/// the sessions of one process sort together and restarts are told apart.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

static PROCESS_TAG: OnceLock<String> = OnceLock::new();
static ATTEMPT: AtomicU32 = AtomicU32::new(0);

/// Generates the id for the next session attempt.
pub(crate) fn next_session_id() -> SessionId {
    let tag = PROCESS_TAG.get_or_init(|| base36(Utc::now().timestamp_millis().unsigned_abs()));
    let attempt = ATTEMPT.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    SessionId(format!("{}-{}", tag, attempt))
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
