//! Operator-assisted captcha solving for the browser transport.
//!
//! Only one captcha is put in front of the operator at a time, whatever the
//! number of workers.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::engine::SearchEngine;
use crate::Result;

static CAPTCHA_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Someone (or something) able to read a captcha image.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Returns the answer, or `None` when nobody answered in time.
    async fn solve(&self, engine: SearchEngine, screenshot: &Path) -> Result<Option<String>>;
}

/// Prompts on the terminal and reads the answer from stdin.
pub struct StdinSolver {
    timeout: Duration,
}

impl StdinSolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CaptchaSolver for StdinSolver {
    async fn solve(&self, engine: SearchEngine, screenshot: &Path) -> Result<Option<String>> {
        warn!(
            "{} wants a captcha solved; screenshot saved to {}",
            engine,
            screenshot.display()
        );
        eprint!("Enter the captcha shown in {}: ", screenshot.display());

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match tokio::time::timeout(self.timeout, stdin.read_line(&mut line)).await {
            Ok(read) => {
                read?;
                let answer = line.trim();
                Ok((!answer.is_empty()).then(|| answer.to_string()))
            }
            Err(_) => {
                info!("No captcha answer within {:?}", self.timeout);
                Ok(None)
            }
        }
    }
}

/// Runs `solver` while holding the process-wide captcha lock.
pub async fn solve_exclusive(
    solver: &dyn CaptchaSolver,
    engine: SearchEngine,
    screenshot: &Path,
) -> Result<Option<String>> {
    let _guard = CAPTCHA_LOCK.lock().await;
    solver.solve(engine, screenshot).await
}
