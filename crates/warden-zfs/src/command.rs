//! Spawns host binaries with captured output and a hard deadline, and wires
//! two of them together for `zfs send | zfs receive` style transfers.

use log::debug;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use warden_core::error::{WardenError, WardenResult};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A binary path, its deadline and the extra environment it runs with.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
    envs: Vec<(String, String)>,
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stderr, or stdout when stderr is empty.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            envs: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// A `Command` for this binary carrying the runner's environment.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.path);
        command.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command
    }

    /// Execute with `args` and an optional stdin payload. A non-zero exit is
    /// returned in `Output::status`, not as an error.
    pub fn run<S: AsRef<OsStr>>(&self, args: &[S], input: Option<&[u8]>) -> WardenResult<Output> {
        let mut command = self.command();
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        debug!("exec {}", describe(&self.path, args));
        let mut child = command.spawn().map_err(|err| {
            WardenError::Provider(format!("cannot spawn {}: {err}", self.path.display()))
        })?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes)?;
                stdin.flush().ok();
            }
        }

        let stdout = spawn_output_reader(child.stdout.take());
        let stderr = spawn_output_reader(child.stderr.take());
        let Some(status) = wait_with_deadline(&mut child, self.timeout)? else {
            return Err(WardenError::Timeout {
                command: describe(&self.path, args),
                after: self.timeout,
            });
        };

        Ok(Output {
            stdout: join_reader(stdout, "stdout")?,
            stderr: join_reader(stderr, "stderr")?,
            status: exit_code(status),
        })
    }

    /// Like `run`, but a non-zero exit becomes a provider error.
    pub fn run_checked<S: AsRef<OsStr>>(&self, args: &[S]) -> WardenResult<Output> {
        let out = self.run(args, None)?;
        if !out.success() {
            return Err(WardenError::Provider(format!(
                "{} exited with code {}: {}",
                describe(&self.path, args),
                out.status,
                if out.diagnostic().is_empty() {
                    "no additional output"
                } else {
                    out.diagnostic()
                }
            )));
        }
        Ok(out)
    }
}

/// Both halves of a finished pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub producer: Output,
    pub consumer: Output,
}

/// Run `producer | consumer`. Both children are killed when the deadline
/// passes; exit codes are reported for the caller to classify.
pub fn run_pipeline(
    mut producer: Command,
    mut consumer: Command,
    timeout: Duration,
) -> WardenResult<PipelineOutput> {
    let label = format!("{} | {}", describe_command(&producer), describe_command(&consumer));
    debug!("exec {label}");

    producer.stdin(Stdio::null());
    producer.stdout(Stdio::piped());
    producer.stderr(Stdio::piped());
    let mut upstream = producer
        .spawn()
        .map_err(|err| WardenError::Provider(format!("cannot spawn {label}: {err}")))?;
    let Some(stream) = upstream.stdout.take() else {
        reap(&mut upstream);
        return Err(WardenError::Provider(format!("{label}: producer has no stdout")));
    };

    consumer.stdin(Stdio::from(stream));
    consumer.stdout(Stdio::piped());
    consumer.stderr(Stdio::piped());
    let spawned = consumer.spawn();
    // The Command still owns a copy of the read end until dropped.
    drop(consumer);
    let mut downstream = match spawned {
        Ok(child) => child,
        Err(err) => {
            reap(&mut upstream);
            return Err(WardenError::Provider(format!("cannot spawn {label}: {err}")));
        }
    };

    let upstream_err = spawn_output_reader(upstream.stderr.take());
    let downstream_out = spawn_output_reader(downstream.stdout.take());
    let downstream_err = spawn_output_reader(downstream.stderr.take());

    let start = Instant::now();
    let mut upstream_status = None;
    let mut downstream_status = None;
    loop {
        if upstream_status.is_none() {
            upstream_status = upstream.try_wait()?;
        }
        if downstream_status.is_none() {
            downstream_status = downstream.try_wait()?;
        }
        if let (Some(up), Some(down)) = (upstream_status, downstream_status) {
            return Ok(PipelineOutput {
                producer: Output {
                    stdout: String::new(),
                    stderr: join_reader(upstream_err, "stderr")?,
                    status: exit_code(up),
                },
                consumer: Output {
                    stdout: join_reader(downstream_out, "stdout")?,
                    stderr: join_reader(downstream_err, "stderr")?,
                    status: exit_code(down),
                },
            });
        }
        if start.elapsed() > timeout {
            reap(&mut upstream);
            reap(&mut downstream);
            return Err(WardenError::Timeout {
                command: label,
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Search `candidates` for the first existing file.
pub fn discover(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> WardenResult<Option<ExitStatus>> {
    let start = Instant::now();
    while start.elapsed() <= timeout {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        thread::sleep(POLL_INTERVAL);
    }
    reap(child);
    Ok(None)
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn describe<S: AsRef<OsStr>>(path: &Path, args: &[S]) -> String {
    let mut text = path.display().to_string();
    for arg in args {
        text.push(' ');
        text.push_str(&arg.as_ref().to_string_lossy());
    }
    text
}

fn describe_command(command: &Command) -> String {
    let args: Vec<&OsStr> = command.get_args().collect();
    describe(Path::new(command.get_program()), &args[..])
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<WardenResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> WardenResult<String> {
        let Some(mut reader) = pipe else {
            return Ok(String::new());
        };
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn join_reader(
    handle: thread::JoinHandle<WardenResult<String>>,
    stream: &str,
) -> WardenResult<String> {
    handle
        .join()
        .map_err(|_| WardenError::Provider(format!("{stream} reader thread panicked")))?
}
