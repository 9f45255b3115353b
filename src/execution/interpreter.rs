//! Sandboxed Rhai interpreter for short machine-authored scripts
//!
//! Scripts run in this process on a blocking-pool thread, not in a child
//! process. The engine has no filesystem, module or eval access, and the
//! progress hook aborts a script once the timeout passes. A thread stuck
//! outside the engine's progress checks cannot be killed; the caller gets a
//! timeout result and the thread is left to finish on its own.

use rhai::{Dynamic, Engine, EvalAltResult};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{truncate_output, ExecutorOutput};

fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(5_000_000);
    engine.set_max_modules(0);
    engine.set_max_functions(64);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(1_000);

    engine.disable_symbol("eval");
    engine.disable_symbol("import");
    engine.disable_symbol("export");

    engine
}

/// Check that a script parses, without running it
pub fn compile_check(script: &str) -> Result<(), String> {
    sandboxed_engine()
        .compile(script)
        .map(|_| ())
        .map_err(|e| format!("script does not compile: {}", e))
}

#[derive(Debug, Clone)]
pub struct InterpreterExecutor {
    timeout: Duration,
    max_output_bytes: usize,
}

impl InterpreterExecutor {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }

    pub fn describe(&self, script: &str) -> String {
        format!(
            "would evaluate a {} character script (timeout {}s, not reversible)",
            script.chars().count(),
            self.timeout.as_secs()
        )
    }

    pub async fn run(&self, script: &str) -> ExecutorOutput {
        let limit = self.timeout;
        let source = script.to_string();
        let printed = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&printed);
        let start = Instant::now();

        let task = tokio::task::spawn_blocking(move || {
            let mut engine = sandboxed_engine();
            let started = Instant::now();
            engine.on_progress(move |_| {
                if started.elapsed() > limit {
                    Some(Dynamic::from("timeout"))
                } else {
                    None
                }
            });
            engine.on_print(move |line| {
                if let Ok(mut lines) = sink.lock() {
                    lines.push(line.to_string());
                }
            });
            engine.eval::<Dynamic>(&source)
        });

        let mut out = ExecutorOutput::default();
        // The progress hook ends the script; the outer bound covers a stuck
        // blocking thread
        let result = tokio::time::timeout(limit + Duration::from_secs(1), task).await;

        let printed = printed.lock().map(|l| l.join("\n")).unwrap_or_default();
        match result {
            Ok(Ok(Ok(value))) => {
                let value = dynamic_to_string(&value);
                let text = match (printed.is_empty(), value.is_empty()) {
                    (true, _) => value,
                    (false, true) => printed,
                    (false, false) => format!("{}\n{}", printed, value),
                };
                out.stdout = truncate_output(&text, self.max_output_bytes);
                out.success = true;
                info!(duration_ms = %start.elapsed().as_millis(), "Script evaluated");
            }
            Ok(Ok(Err(e))) => {
                out.stdout = truncate_output(&printed, self.max_output_bytes);
                if matches!(*e, EvalAltResult::ErrorTerminated(..)) {
                    out.timed_out = true;
                    out.error = Some(format!("timed out after {}s", limit.as_secs()));
                    warn!(timeout = ?limit, "Script terminated");
                } else {
                    out.stderr = e.to_string();
                    out.error = Some(format!("script error: {}", e));
                }
            }
            Ok(Err(join)) => {
                out.error = Some(format!("interpreter task failed: {}", join));
            }
            Err(_) => {
                out.timed_out = true;
                out.error = Some(format!("timed out after {}s", limit.as_secs()));
                warn!(timeout = ?limit, "Script exceeded its wall-clock bound");
            }
        }
        out
    }
}

fn dynamic_to_string(value: &Dynamic) -> String {
    if value.is_unit() {
        String::new()
    } else if let Some(arr) = value.read_lock::<rhai::Array>() {
        let items: Vec<String> = arr.iter().map(dynamic_to_string).collect();
        format!("[{}]", items.join(", "))
    } else if let Some(map) = value.read_lock::<rhai::Map>() {
        let items: Vec<String> = map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, dynamic_to_string(v)))
            .collect();
        format!("{{{}}}", items.join(", "))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evaluates_expression() {
        let exec = InterpreterExecutor::new(Duration::from_secs(5), 1024);
        let out = exec.run("let x = 6; x * 7").await;
        assert!(out.success, "{:?}", out.error);
        assert_eq!(out.stdout, "42");
    }

    #[tokio::test]
    async fn test_captures_print() {
        let exec = InterpreterExecutor::new(Duration::from_secs(5), 1024);
        let out = exec.run(r#"print("hi"); [1, 2]"#).await;
        assert!(out.success);
        assert_eq!(out.stdout, "hi\n[1, 2]");
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let exec = InterpreterExecutor::new(Duration::from_secs(1), 1024);
        let out = exec.run("loop { }").await;
        assert!(!out.success);
        assert!(out.timed_out || out.error.is_some());
    }

    #[tokio::test]
    async fn test_eval_is_disabled() {
        let exec = InterpreterExecutor::new(Duration::from_secs(5), 1024);
        let out = exec.run(r#"eval("1 + 1")"#).await;
        assert!(!out.success);
    }

    #[test]
    fn test_compile_check() {
        assert!(compile_check("1 + 2").is_ok());
        assert!(compile_check("let = ;").is_err());
    }
}
