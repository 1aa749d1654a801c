//! Reference host: uppercases text.
//!
//! Used by the integration tests and for smoke-testing pools. Faults can be
//! injected through the environment and the text itself:
//! - `RELAIS_UPPER_NOISE=1`: print junk to stdout during setup and every call
//! - `RELAIS_UPPER_FAIL_IF_EXISTS=<path>`: fail setup when `<path>` exists
//! - `#crash` in the text: exit mid-call without answering
//! - `#fail` in the text: answer with a command error
//! - `#sleep=<ms>` in the text: wait before answering

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use relais::host::{CommandError, Computation, SetupError, serve_stdio};
use serde_json::{Map, Value};

const CRASH_EXIT_CODE: i32 = 3;

struct Upper {
    noise: bool,
    fail_marker: Option<PathBuf>,
}

impl Upper {
    fn from_env() -> Self {
        Self {
            noise: std::env::var("RELAIS_UPPER_NOISE").as_deref() == Ok("1"),
            fail_marker: std::env::var_os("RELAIS_UPPER_FAIL_IF_EXISTS").map(PathBuf::from),
        }
    }
}

#[async_trait::async_trait]
impl Computation for Upper {
    async fn setup(&mut self) -> Result<(), SetupError> {
        if self.noise {
            println!("Loading checkpoint shards: 100%|##########| 2/2");
        }
        if let Some(marker) = &self.fail_marker
            && marker.exists()
        {
            return Err(SetupError::load(format!(
                "refusing to start while {} exists",
                marker.display()
            )));
        }
        Ok(())
    }

    async fn call(
        &mut self,
        command: &str,
        payload: Map<String, Value>,
    ) -> Result<Value, CommandError> {
        if command != "upper" {
            return Err(CommandError::Unknown(command.to_string()));
        }
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::InvalidPayload("expected string field 'text'".into()))?;

        if self.noise {
            println!("upper: {} chars", text.len());
        }
        if text.contains("#crash") {
            tracing::warn!("Crash requested, exiting without a response");
            std::process::exit(CRASH_EXIT_CODE);
        }
        if text.contains("#fail") {
            return Err(CommandError::Failed("failure requested".into()));
        }
        if let Some(ms) = requested_delay(text) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        Ok(Value::from(text.to_uppercase()))
    }
}

fn requested_delay(text: &str) -> Option<u64> {
    let (_, rest) = text.split_once("#sleep=")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    relais::logging::init_tracing();
    serve_stdio(Upper::from_env())
        .await
        .context("relais-upper host failed")
}
