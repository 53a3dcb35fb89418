//! Remote command helpers
//!
//! Some SSH servers occasionally run an exec request without delivering any
//! output. [`retry`] repeats an action while both streams come back empty;
//! genuine failures (anything on stderr) are returned as-is.

use std::borrow::Cow;
use std::future::Future;

use tracing::debug;

use super::platform::RemotePlatform;
use crate::ssh::{ExecResult, TransportError};

/// Run `action` up to `times` times, stopping at the first non-empty result.
///
/// After the last attempt the (empty) result is returned unchanged.
pub async fn retry<F, Fut>(mut action: F, times: u32) -> Result<ExecResult, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ExecResult, TransportError>>,
{
    let mut result = ExecResult::default();
    for attempt in 1..=times {
        result = action().await?;
        if !result.is_empty() {
            return Ok(result);
        }
        debug!("[remote-setup] Empty exec result (attempt {}/{})", attempt, times);
    }
    Ok(result)
}

/// Quote one argument for the remote shell
pub fn quote(platform: RemotePlatform, arg: &str) -> String {
    match platform {
        RemotePlatform::Windows => shell_escape::windows::escape(Cow::Borrowed(arg)).into_owned(),
        _ => shell_escape::unix::escape(Cow::Borrowed(arg)).into_owned(),
    }
}

/// `program arg1 arg2 ...` with every argument quoted
pub fn command_line<S: AsRef<str>>(platform: RemotePlatform, program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(platform, arg.as_ref()));
    }
    line
}
