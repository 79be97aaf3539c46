use std::ffi::OsString;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Raised (inside an `anyhow::Error`) when the program to launch does not exist.
#[derive(Debug, thiserror::Error)]
#[error("executable not found: {program}")]
pub struct ToolNotFound {
    pub program: String,
}

pub(crate) struct ChildOutput {
    /// Process exit code, or the negated signal number when killed by a signal.
    pub retcode: i32,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[cfg(unix)]
fn apply_rlimits() -> std::io::Result<()> {
    // Fault-signal tests must not litter the working directory with cores.
    unsafe {
        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn run_child(
    argv: &[OsString],
    input: Option<&[u8]>,
    env: &[(String, String)],
    timeout: Duration,
    output_cap: usize,
) -> Result<ChildOutput> {
    let (program, args) = argv.split_first().context("empty command line")?;

    let mut child = {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        for (k, v) in env {
            cmd.env(k, v);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            // Own process group, so a timeout also reaches forked descendants.
            cmd.process_group(0);
            unsafe {
                cmd.pre_exec(apply_rlimits);
            }
        }

        match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(anyhow::Error::new(ToolNotFound {
                    program: program.to_string_lossy().into_owned(),
                }));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("spawn {}", program.to_string_lossy()))
            }
        }
    };

    let stdin_thread = match (child.stdin.take(), input) {
        (Some(mut stdin), Some(input)) => {
            let input = input.to_vec();
            Some(std::thread::spawn(move || -> std::io::Result<()> {
                stdin.write_all(&input)?;
                stdin.flush()?;
                drop(stdin);
                Ok(())
            }))
        }
        _ => None,
    };
    let stdout = child.stdout.take().context("take stdout")?;
    let stderr = child.stderr.take().context("take stderr")?;

    let stdout_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        read_to_end_capped(stdout, output_cap)
    });
    let stderr_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        read_to_end_capped(stderr, output_cap)
    });

    let (status, timed_out) = wait_child_with_wall_timeout(&mut child, timeout)?;
    // Descendants left behind would hold the output pipes open.
    kill_process_group(child.id());
    if let Some(t) = stdin_thread {
        // A child that exits without draining stdin yields EPIPE here; that is its business.
        let _ = t.join();
    }
    let (stdout_bytes, stdout_truncated) = stdout_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;
    let (stderr_bytes, stderr_truncated) = stderr_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;
    if stdout_truncated || stderr_truncated {
        log::warn!("child output exceeded {output_cap} bytes and was truncated");
    }

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    let retcode = match status.code() {
        Some(code) => code,
        None => signal.map(|s| -s).unwrap_or(-1),
    };
    Ok(ChildOutput {
        retcode,
        signal,
        timed_out,
        stdout: stdout_bytes,
        stderr: stderr_bytes,
    })
}

fn wait_child_with_wall_timeout(
    child: &mut std::process::Child,
    wall_limit: Duration,
) -> Result<(std::process::ExitStatus, bool)> {
    let deadline = Instant::now().checked_add(wall_limit);

    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            kill_process_group(child.id());
            let _ = child.kill();
            let status = child.wait().context("wait child after kill")?;
            return Ok((status, true));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    unsafe {
        // ESRCH once the whole group is gone.
        let _ = libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

pub(crate) fn read_to_end_capped<R: Read>(
    mut reader: R,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }

        if truncated {
            continue;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

pub fn signal_name(signal: i32) -> String {
    #[cfg(unix)]
    {
        let name = match signal {
            libc::SIGHUP => "SIGHUP",
            libc::SIGINT => "SIGINT",
            libc::SIGQUIT => "SIGQUIT",
            libc::SIGILL => "SIGILL",
            libc::SIGTRAP => "SIGTRAP",
            libc::SIGABRT => "SIGABRT",
            libc::SIGBUS => "SIGBUS",
            libc::SIGFPE => "SIGFPE",
            libc::SIGKILL => "SIGKILL",
            libc::SIGUSR1 => "SIGUSR1",
            libc::SIGSEGV => "SIGSEGV",
            libc::SIGUSR2 => "SIGUSR2",
            libc::SIGPIPE => "SIGPIPE",
            libc::SIGALRM => "SIGALRM",
            libc::SIGTERM => "SIGTERM",
            libc::SIGXCPU => "SIGXCPU",
            libc::SIGXFSZ => "SIGXFSZ",
            libc::SIGSYS => "SIGSYS",
            _ => "",
        };
        if !name.is_empty() {
            return name.to_string();
        }
    }
    format!("signal {signal}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_reader_truncates() {
        let data = vec![7u8; 20_000];
        let (buf, truncated) = read_to_end_capped(&data[..], 10_000).unwrap();
        assert_eq!(buf.len(), 10_000);
        assert!(truncated);

        let (buf, truncated) = read_to_end_capped(&b"hello"[..], 10_000).unwrap();
        assert_eq!(buf, b"hello");
        assert!(!truncated);
    }

    #[cfg(unix)]
    #[test]
    fn names_fault_signals() {
        assert_eq!(signal_name(libc::SIGFPE), "SIGFPE");
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(1000), "signal 1000");
    }
}
