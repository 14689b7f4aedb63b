/// Preparation of the looped raw-video input fed to the sender.
///
/// Three sequential ffmpeg invocations:
///   1. raw YUV input      → H.264 intermediate (.mp4)
///   2. intermediate       → stream-looped to the requested duration (.mp4)
///   3. looped             → raw YUV again, for the peer client's file capturer
///
/// Output name: `<output_dir>/<stem>_<W>x<H>_<fps>fps_<secs>s.yuv`.
use std::path::{Path, PathBuf};
use tokio::sync::watch;

use crate::config::VideoConfig;
use crate::error::RunError;
use crate::event::shutdown_requested;
use crate::paths::sanitize_component;
use crate::process::{run_step, tail_text, CommandSpec};

pub struct VideoJob {
    config: VideoConfig,
    duration_secs: u64,
}

impl VideoJob {
    pub fn new(config: VideoConfig, duration_secs: u64) -> Self {
        Self {
            config,
            duration_secs: duration_secs.max(1),
        }
    }

    fn input(&self) -> PathBuf {
        PathBuf::from(&self.config.input)
    }

    fn base_name(&self) -> String {
        let stem = self
            .input()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        format!(
            "{}_{}x{}_{}fps",
            sanitize_component(&stem),
            self.config.width,
            self.config.height,
            self.config.fps
        )
    }

    fn out_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.output_dir)
    }

    pub fn intermediate_path(&self) -> PathBuf {
        self.out_dir().join(format!("{}.mp4", self.base_name()))
    }

    pub fn looped_path(&self) -> PathBuf {
        self.out_dir()
            .join(format!("{}_{}s.mp4", self.base_name(), self.duration_secs))
    }

    pub fn output_path(&self) -> PathBuf {
        self.out_dir()
            .join(format!("{}_{}s.yuv", self.base_name(), self.duration_secs))
    }

    fn ffmpeg(&self, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(&self.config.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(args)
    }

    pub fn transcode_command(&self) -> CommandSpec {
        let c = &self.config;
        self.ffmpeg(vec![
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            c.pix_fmt.clone(),
            "-s".into(),
            format!("{}x{}", c.width, c.height),
            "-r".into(),
            c.fps.to_string(),
            "-i".into(),
            c.input.clone(),
            "-c:v".into(),
            c.codec.clone(),
            "-b:v".into(),
            c.bitrate.clone(),
            "-pix_fmt".into(),
            c.pix_fmt.clone(),
            path_arg(&self.intermediate_path()),
        ])
    }

    pub fn loop_command(&self) -> CommandSpec {
        self.ffmpeg(vec![
            "-stream_loop".into(),
            "-1".into(),
            "-i".into(),
            path_arg(&self.intermediate_path()),
            "-t".into(),
            self.duration_secs.to_string(),
            "-c".into(),
            "copy".into(),
            path_arg(&self.looped_path()),
        ])
    }

    pub fn decode_command(&self) -> CommandSpec {
        self.ffmpeg(vec![
            "-i".into(),
            path_arg(&self.looped_path()),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            self.config.pix_fmt.clone(),
            path_arg(&self.output_path()),
        ])
    }

    /// Runs the three steps in order and returns the final raw-video path.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<PathBuf, RunError> {
        let input = self.input();
        if !input.is_file() {
            return Err(RunError::Setup(format!(
                "video input {} does not exist",
                input.display()
            )));
        }
        std::fs::create_dir_all(self.out_dir()).map_err(|e| {
            RunError::Setup(format!("cannot create {}: {e}", self.out_dir().display()))
        })?;

        let steps = [
            ("transcode", self.transcode_command()),
            ("loop", self.loop_command()),
            ("decode", self.decode_command()),
        ];
        for (label, spec) in &steps {
            tracing::info!(step = label, command = %spec, "ffmpeg");
            let result = tokio::select! {
                out = run_step(spec, None) => out,
                _ = shutdown_requested(&mut shutdown) => return Err(RunError::Interrupted),
            };
            let output = result.map_err(|source| RunError::Launch {
                command: spec.to_string(),
                source,
            })?;

            if !output.status.success() {
                tracing::error!(
                    step = label,
                    "ffmpeg failed ({}): {}",
                    output.status,
                    tail_text(&output.stderr, 10)
                );
                return Err(RunError::Downstream {
                    code: output.status.code(),
                });
            }
        }

        for tmp in [self.intermediate_path(), self.looped_path()] {
            if let Err(e) = std::fs::remove_file(&tmp) {
                tracing::debug!("Failed to remove {}: {e}", tmp.display());
            }
        }

        let out = self.output_path();
        tracing::info!(path = %out.display(), secs = self.duration_secs, "looped video ready");
        Ok(out)
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use std::time::Duration;

    fn job(dir: &Path, ffmpeg: &str, input: &str) -> VideoJob {
        let config = VideoConfig {
            ffmpeg: ffmpeg.to_string(),
            input: dir.join(input).to_string_lossy().into_owned(),
            output_dir: dir.join("out").to_string_lossy().into_owned(),
            ..VideoConfig::default()
        };
        VideoJob::new(config, 20)
    }

    // ── naming ────────────────────────────────────────────────────────────────

    #[test]
    fn output_names_are_templated() {
        let j = job(Path::new("/v"), "ffmpeg", "foreman.yuv");
        assert_eq!(j.intermediate_path(), Path::new("/v/out/foreman_1280x720_30fps.mp4"));
        assert_eq!(j.looped_path(), Path::new("/v/out/foreman_1280x720_30fps_20s.mp4"));
        assert_eq!(j.output_path(), Path::new("/v/out/foreman_1280x720_30fps_20s.yuv"));
    }

    #[test]
    fn duration_has_floor_of_one_second() {
        let j = VideoJob::new(VideoConfig::default(), 0);
        assert!(j.output_path().to_string_lossy().ends_with("_1s.yuv"));
    }

    // ── argument lists ────────────────────────────────────────────────────────

    #[test]
    fn transcode_describes_raw_input() {
        let j = job(Path::new("/v"), "ffmpeg", "foreman.yuv");
        let args = j.transcode_command().args;
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt yuv420p -s 1280x720 -r 30 -i /v/foreman.yuv"));
        assert!(joined.contains("-c:v libx264 -b:v 2M"));
        assert_eq!(args.last().unwrap(), "/v/out/foreman_1280x720_30fps.mp4");
    }

    #[test]
    fn loop_and_decode_chain_through_intermediates() {
        let j = job(Path::new("/v"), "ffmpeg", "foreman.yuv");
        let looped = j.loop_command().args.join(" ");
        assert!(looped.contains("-stream_loop -1 -i /v/out/foreman_1280x720_30fps.mp4 -t 20 -c copy"));
        let decode = j.decode_command().args;
        assert_eq!(decode.last().unwrap(), "/v/out/foreman_1280x720_30fps_20s.yuv");
        assert!(decode.contains(&"/v/out/foreman_1280x720_30fps_20s.mp4".to_string()));
    }

    // ── run ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_input_is_setup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let j = job(dir.path(), "ffmpeg", "absent.yuv");
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(j.run(rx).await, Err(RunError::Setup(_))));
    }

    #[tokio::test]
    async fn runs_steps_and_cleans_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.yuv"), b"frames").unwrap();
        // Writes its input name into the last argument.
        let ffmpeg = write_script(
            dir.path(),
            "fake-ffmpeg",
            r#"for a; do last="$a"; done; echo "$*" > "$last""#,
        );
        let j = job(dir.path(), &ffmpeg.to_string_lossy(), "clip.yuv");
        let (_tx, rx) = watch::channel(false);

        let out = j.run(rx).await.unwrap();
        assert_eq!(out, j.output_path());
        assert!(out.exists());
        assert!(!j.intermediate_path().exists());
        assert!(!j.looped_path().exists());
    }

    #[tokio::test]
    async fn failing_step_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.yuv"), b"frames").unwrap();
        let ffmpeg = write_script(dir.path(), "bad-ffmpeg", "echo 'Invalid data' >&2; exit 69");
        let j = job(dir.path(), &ffmpeg.to_string_lossy(), "clip.yuv");
        let (_tx, rx) = watch::channel(false);

        match j.run(rx).await {
            Err(RunError::Downstream { code }) => assert_eq!(code, Some(69)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.yuv"), b"frames").unwrap();
        let j = job(dir.path(), "/nonexistent/ffmpeg", "clip.yuv");
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(j.run(rx).await, Err(RunError::Launch { .. })));
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_running_step() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.yuv"), b"frames").unwrap();
        let ffmpeg = write_script(dir.path(), "slow-ffmpeg", "sleep 30");
        let j = job(dir.path(), &ffmpeg.to_string_lossy(), "clip.yuv");
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });

        let res = tokio::time::timeout(Duration::from_secs(5), j.run(rx)).await.unwrap();
        assert!(matches!(res, Err(RunError::Interrupted)));
    }
}
