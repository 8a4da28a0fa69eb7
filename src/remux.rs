#![forbid(unsafe_code)]

//! Stream-copy merge of downloaded segments through the external
//! multiplexer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

const INTERMEDIATE_NAME: &str = "merged.ts";

#[derive(Debug, Error)]
pub enum RemuxError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{step} exited with {status}: {stderr}")]
    ExitStatus {
        step: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{step} produced no output at {}", path.display())]
    EmptyOutput { step: &'static str, path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Remuxer {
    program: PathBuf,
}

impl Remuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Concatenates the files listed in `concat_list` into a transport
    /// stream inside `work_dir`, then remuxes it into `output`. The
    /// intermediate stream is always removed; `output` is removed on failure.
    pub fn merge(
        &self,
        concat_list: &Path,
        work_dir: &Path,
        output: &Path,
    ) -> Result<(), RemuxError> {
        let intermediate = work_dir.join(INTERMEDIATE_NAME);
        let result = self.run_passes(concat_list, &intermediate, output);
        let _ = fs::remove_file(&intermediate);
        if result.is_err() {
            let _ = fs::remove_file(output);
        }
        result
    }

    fn run_passes(
        &self,
        concat_list: &Path,
        intermediate: &Path,
        output: &Path,
    ) -> Result<(), RemuxError> {
        let list = concat_list.to_string_lossy();
        let ts = intermediate.to_string_lossy();
        let mp4 = output.to_string_lossy();

        #[rustfmt::skip]
        let concat: &[&str] = &[
            "-y", "-hide_banner", "-loglevel", "error",
            "-fflags", "+genpts+discardcorrupt",
            "-f", "concat", "-safe", "0",
            "-i", &list,
            "-c", "copy",
            "-avoid_negative_ts", "make_zero",
            &ts,
        ];
        self.run("concat pass", concat, intermediate)?;

        #[rustfmt::skip]
        let remux: &[&str] = &[
            "-y", "-hide_banner", "-loglevel", "error",
            "-i", &ts,
            "-map", "0",
            "-c", "copy",
            "-bsf:a", "aac_adtstoasc",
            "-movflags", "+faststart",
            &mp4,
        ];
        self.run("remux pass", remux, output)
    }

    fn run(&self, step: &'static str, args: &[&str], produced: &Path) -> Result<(), RemuxError> {
        log::debug!("{step}: {} {}", self.program.display(), args.join(" "));
        let result = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RemuxError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        if !result.status.success() {
            return Err(RemuxError::ExitStatus {
                step,
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        match fs::metadata(produced) {
            Ok(metadata) if metadata.len() > 0 => Ok(()),
            _ => Err(RemuxError::EmptyOutput {
                step,
                path: produced.to_path_buf(),
            }),
        }
    }
}
