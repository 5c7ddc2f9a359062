use crate::backup::command::{create_output_file, exit_code, new_command, spawn_error, split_msg, ExecOutput};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDetails;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::thread::JoinHandle;

/// Producer process whose standard output is piped through a compressor into a file.
///
/// Both standard error streams are drained on their own threads while the
/// processes run, so neither side can block on a full pipe. The exit code of
/// the result is the producer's; a failing compressor is reported as an error
/// carrying only the compressor's stderr lines.
pub struct PipedCommand<'a> {
    producer: &'a [String],
    compressor: &'a [String],
    env: &'a BTreeMap<String, RedactedString>,
}

impl<'a> PipedCommand<'a> {
    pub fn new(
        producer: &'a [String],
        compressor: &'a [String],
        env: &'a BTreeMap<String, RedactedString>,
    ) -> Self {
        Self {
            producer,
            compressor,
            env,
        }
    }

    pub fn run(&self, out_path: &Path) -> Result<ExecOutput> {
        if self.producer.is_empty() || self.compressor.is_empty() {
            return Err(Error::command("Empty command line in piped command."));
        }
        let out_file = create_output_file(out_path)?;

        let mut producer = new_command(self.producer, self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(self.producer, e))?;

        let Some(pipe) = producer.stdout.take() else {
            reap(&mut producer);
            return Err(Error::command("Standard output of producer not captured."));
        };

        let mut compressor_cmd = new_command(self.compressor, self.env);
        compressor_cmd
            .stdin(Stdio::from(pipe))
            .stdout(Stdio::from(out_file))
            .stderr(Stdio::piped());
        let compressor = compressor_cmd.spawn();
        // Release our copy of the pipe so the compressor sees EOF once the producer exits.
        drop(compressor_cmd);

        let mut compressor = match compressor {
            Ok(child) => child,
            Err(e) => {
                reap(&mut producer);
                discard(out_path);
                return Err(spawn_error(self.compressor, e));
            }
        };

        let producer_stderr = drain(producer.stderr.take());
        let compressor_stderr = drain(compressor.stderr.take());

        let producer_status = producer.wait()?;
        let compressor_status = compressor.wait()?;
        let producer_stderr = collect(producer_stderr)?;
        let compressor_stderr = collect(compressor_stderr)?;

        if !compressor_status.success() {
            discard(out_path);
            let mut details = split_msg(&String::from_utf8_lossy(&compressor_stderr));
            if !producer_status.success() {
                details.push(format!(
                    "{} failed with error code: {}.",
                    self.producer[0],
                    exit_code(producer_status)
                ));
                details.extend(split_msg(&String::from_utf8_lossy(&producer_stderr)));
            }
            return Err(Error::command(format!(
                "Compression of output into {:?} failed with error code: {}.",
                out_path,
                exit_code(compressor_status)
            ))
            .add_details(details));
        }

        Ok(ExecOutput {
            exit_code: exit_code(producer_status),
            stdout: Vec::new(),
            stderr: producer_stderr,
        })
    }
}

/// Removes a partial output file.
fn discard(out_path: &Path) {
    if let Err(e) = std::fs::remove_file(out_path) {
        tracing::warn!("Removal of partial output file {:?} failed: {e}", out_path);
    }
}

fn reap(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            stream.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn collect(handle: JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| Error::command("Reading of command error output panicked."))?
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::ErrorKind;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_identity_compressor_preserves_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source.bin");
        // Larger than a pipe buffer so both ends have to make progress together.
        let data: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();
        let out_path = temp_dir.path().join("dump.gz");

        let producer = vec!["cat".to_string(), source.to_string_lossy().into_owned()];
        let compressor = vec!["cat".to_string()];
        let env = BTreeMap::new();
        let output = PipedCommand::new(&producer, &compressor, &env)
            .run(&out_path)
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(std::fs::read(&out_path).unwrap(), data);
    }

    #[test]
    fn test_gzip_compressor_output() {
        let temp_dir = TempDir::new().unwrap();
        let out_path = temp_dir.path().join("dump.gz");

        let producer = sh("echo payload");
        let compressor = vec!["gzip".to_string()];
        let env = BTreeMap::new();
        PipedCommand::new(&producer, &compressor, &env)
            .run(&out_path)
            .unwrap();

        let bytes = std::fs::read(&out_path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_compressor_failure_reports_compressor_stderr() {
        let temp_dir = TempDir::new().unwrap();
        let out_path = temp_dir.path().join("dump.gz");

        let producer = sh("echo data; echo producer-noise >&2");
        let compressor = sh("cat >/dev/null; echo compressor-broke >&2; exit 2");
        let env = BTreeMap::new();
        let error = PipedCommand::new(&producer, &compressor, &env)
            .run(&out_path)
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Command);
        assert_eq!(error.details(), vec!["compressor-broke"]);
        assert!(error.to_string().contains("error code: 2"));
    }

    #[test]
    fn test_both_sides_failing_keeps_producer_error_and_removes_output() {
        let temp_dir = TempDir::new().unwrap();
        let out_path = temp_dir.path().join("dump.gz");

        let producer = sh("echo partial; echo 'dump failed' >&2; exit 1");
        let compressor = sh("cat >/dev/null; echo 'disk full' >&2; exit 1");
        let env = BTreeMap::new();
        let error = PipedCommand::new(&producer, &compressor, &env)
            .run(&out_path)
            .unwrap_err();

        assert_eq!(
            error.details(),
            vec!["disk full", "sh failed with error code: 1.", "dump failed"]
        );
        assert!(!out_path.exists());
    }

    #[test]
    fn test_producer_exit_code_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let out_path = temp_dir.path().join("dump.gz");

        let producer = sh("echo partial; echo 'dump failed' >&2; exit 4");
        let compressor = vec!["cat".to_string()];
        let env = BTreeMap::new();
        let output = PipedCommand::new(&producer, &compressor, &env)
            .run(&out_path)
            .unwrap();

        assert_eq!(output.exit_code, 4);
        assert_eq!(output.stderr_lines(), vec!["dump failed"]);
        assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "partial\n");
    }

    #[test]
    fn test_missing_compressor_binary() {
        let temp_dir = TempDir::new().unwrap();
        let out_path = temp_dir.path().join("dump.gz");

        let producer = sh("echo data");
        let compressor = vec!["/nonexistent/compressor".to_string()];
        let env = BTreeMap::new();
        let error = PipedCommand::new(&producer, &compressor, &env)
            .run(&out_path)
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Command);
        assert!(!out_path.exists());
    }
}
