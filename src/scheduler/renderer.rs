//! External renderer adapters.
//!
//! A [`Renderer`] turns a source artifact into an output file. The scheduler
//! only sees the trait; [`ProcessRenderer`] runs a command-line renderer
//! (`manim` by default) as a child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::RenderError;

/// Number of trailing output lines kept for failure messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// Renders a source artifact into an output file.
///
/// Implementations must stop any work they started when the returned future
/// is dropped, and must not take longer than `timeout`.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renders `source` into `output`, returning the produced file path.
    async fn render(
        &self,
        source: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, RenderError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "renderer"
    }
}

/// Render quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RenderQuality {
    #[default]
    Low,
    Medium,
    High,
}

impl RenderQuality {
    /// Value passed to `--quality=`.
    pub fn flag(&self) -> &'static str {
        match self {
            RenderQuality::Low => "l",
            RenderQuality::Medium => "m",
            RenderQuality::High => "h",
        }
    }
}

impl FromStr for RenderQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l" | "low" => Ok(RenderQuality::Low),
            "m" | "medium" => Ok(RenderQuality::Medium),
            "h" | "high" => Ok(RenderQuality::High),
            other => Err(format!("unknown render quality '{other}' (expected L, M or H)")),
        }
    }
}

impl std::fmt::Display for RenderQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.flag().to_ascii_uppercase())
    }
}

fn scene_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"class\s+(\w+)\s*\(\s*Scene\s*\)").expect("scene pattern is valid")
    })
}

fn any_class_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"class\s+(\w+)\s*\(").expect("class pattern is valid"))
}

/// Finds the scene class to render.
///
/// Prefers a class deriving directly from `Scene`, then falls back to the
/// first class definition with a base list.
pub fn extract_scene_class(code: &str) -> Option<&str> {
    scene_pattern()
        .captures(code)
        .or_else(|| any_class_pattern().captures(code))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Renderer that runs an external command.
///
/// Arguments are templates; these placeholders are substituted per render:
/// `{source}`, `{scene}`, `{quality}`, `{output}`, `{output_name}` and
/// `{output_dir}`. The command runs with the output directory as its working
/// directory.
#[derive(Debug, Clone)]
pub struct ProcessRenderer {
    program: String,
    args: Vec<String>,
    quality: RenderQuality,
}

impl ProcessRenderer {
    /// Creates a renderer for `program` with the given argument templates.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            quality: RenderQuality::default(),
        }
    }

    /// The stock `manim` invocation.
    pub fn manim() -> Self {
        Self::new(
            "manim",
            [
                "{source}",
                "{scene}",
                "--quality={quality}",
                "--output_file={output_name}",
                "--disable_caching",
                "--write_to_movie",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    /// Builds a renderer from a whitespace-separated command line template.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn with_quality(mut self, quality: RenderQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn expand_args(&self, source: &Path, output: &Path) -> Result<Vec<String>, RenderError> {
        let scene = if self.args.iter().any(|a| a.contains("{scene}")) {
            let code = tokio::fs::read_to_string(source).await.map_err(|e| {
                RenderError::InvalidSource(format!("cannot read {}: {e}", source.display()))
            })?;
            extract_scene_class(&code)
                .map(str::to_string)
                .ok_or_else(|| RenderError::InvalidSource("no scene class found".to_string()))?
        } else {
            String::new()
        };

        let output_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output_dir = output
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = source.to_string_lossy();
        let output_str = output.to_string_lossy();

        Ok(self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source)
                    .replace("{scene}", &scene)
                    .replace("{quality}", self.quality.flag())
                    .replace("{output_name}", &output_name)
                    .replace("{output_dir}", &output_dir)
                    .replace("{output}", &output_str)
            })
            .collect())
    }
}

impl Default for ProcessRenderer {
    fn default() -> Self {
        Self::manim()
    }
}

#[async_trait]
impl Renderer for ProcessRenderer {
    async fn render(
        &self,
        source: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, RenderError> {
        let start = Instant::now();
        let args = self.expand_args(source, output).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, ?args, "Spawning renderer");
        let mut child = cmd.spawn().map_err(|e| RenderError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().map(|s| tokio::spawn(collect_tail(s, "stdout")));
        let stderr = child.stderr.take().map(|s| tokio::spawn(collect_tail(s, "stderr")));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(RenderError::Io(e)),
            Err(_) => {
                warn!(
                    program = %self.program,
                    pid = ?child.id(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Renderer timed out, killing process"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out renderer");
                }
                return Err(RenderError::Timeout(timeout));
            }
        };

        let stdout = join_tail(stdout).await;
        let stderr = join_tail(stderr).await;

        if !status.success() {
            let output = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(RenderError::Failed {
                code: status.code(),
                output,
            });
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(RenderError::MissingOutput(output.to_path_buf()));
        }

        info!(
            program = %self.program,
            output = %output.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Render finished"
        );
        Ok(output.to_path_buf())
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Reads a stream to the end, keeping only its last lines.
async fn collect_tail<R>(stream: R, label: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut tail = std::collections::VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(stream = label, "[renderer] {}", line);
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream = label, error = %e, "Error reading renderer output");
                break;
            }
        }
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

async fn join_tail(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> ProcessRenderer {
        ProcessRenderer::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "{source}".to_string(), "{output}".to_string()],
        )
    }

    #[test]
    fn test_extract_scene_class() {
        let code = "from manim import *\nclass Helper(object):\n    pass\nclass Intro(Scene):\n    pass\n";
        assert_eq!(extract_scene_class(code), Some("Intro"));

        let code = "class Fancy(MovingCameraScene):\n    pass\n";
        assert_eq!(extract_scene_class(code), Some("Fancy"));

        assert_eq!(extract_scene_class("print('hi')"), None);
    }

    #[test]
    fn test_quality_parsing() {
        assert_eq!("L".parse::<RenderQuality>().unwrap(), RenderQuality::Low);
        assert_eq!("medium".parse::<RenderQuality>().unwrap(), RenderQuality::Medium);
        assert_eq!("h".parse::<RenderQuality>().unwrap(), RenderQuality::High);
        assert!("ultra".parse::<RenderQuality>().is_err());
        assert_eq!(RenderQuality::High.to_string(), "H");
    }

    #[tokio::test]
    async fn test_expand_args_substitutes_placeholders() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("intro.py");
        tokio::fs::write(&source, "class Intro(Scene):\n    pass\n").await.unwrap();
        let output = dir.path().join("intro_1.mp4");

        let renderer = ProcessRenderer::manim().with_quality(RenderQuality::Medium);
        let args = renderer.expand_args(&source, &output).await.unwrap();

        assert_eq!(args[0], source.to_string_lossy());
        assert_eq!(args[1], "Intro");
        assert_eq!(args[2], "--quality=m");
        assert_eq!(args[3], "--output_file=intro_1.mp4");
    }

    #[tokio::test]
    async fn test_missing_scene_is_invalid_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("empty.py");
        tokio::fs::write(&source, "x = 1\n").await.unwrap();

        let err = ProcessRenderer::manim()
            .render(&source, &dir.path().join("out.mp4"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidSource(_)));
    }

    #[tokio::test]
    async fn test_process_renderer_success() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("scene.py");
        tokio::fs::write(&source, "class A(Scene): pass\n").await.unwrap();
        let output = dir.path().join("scene_out.mp4");

        let produced = sh(r#"cp "$0" "$1""#)
            .render(&source, &output, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(produced, output);
        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_process_renderer_failure_captures_stderr() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("scene.py");
        tokio::fs::write(&source, "").await.unwrap();

        let err = sh("echo 'NameError: Circle' >&2; exit 3")
            .render(&source, &dir.path().join("out.mp4"), Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            RenderError::Failed { code, output } => {
                assert_eq!(code, Some(3));
                assert!(output.contains("NameError: Circle"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_renderer_missing_output() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("scene.py");
        tokio::fs::write(&source, "").await.unwrap();

        let err = sh("true")
            .render(&source, &dir.path().join("never.mp4"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingOutput(_)));
    }

    #[tokio::test]
    async fn test_process_renderer_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let renderer = ProcessRenderer::new("definitely-not-a-real-renderer", vec![]);

        let err = renderer
            .render(&dir.path().join("a.py"), &dir.path().join("a.mp4"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Spawn { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_process_renderer_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("slow.py");
        tokio::fs::write(&source, "").await.unwrap();

        let err = sh(r#"echo $$ > "$0.pid"; exec sleep 30"#)
            .render(&source, &dir.path().join("slow.mp4"), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Timeout(_)));

        let pid = std::fs::read_to_string(dir.path().join("slow.py.pid")).unwrap();
        let proc_dir = PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_dir.exists(), "renderer process should be reaped");
    }
}
