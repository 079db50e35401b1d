#![allow(dead_code)]
pub mod fragments;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const SMALL_DELAY: Duration = Duration::from_millis(200);

pub struct TestCtx {
    pub data_dir: PathBuf,
    pub smtp_port: u16,
    pub imap_port: u16,
}

impl TestCtx {
    pub fn connect_imap(&self) -> Result<TcpStream> {
        connect(self.imap_port)
    }

    pub fn connect_smtp(&self) -> Result<TcpStream> {
        connect(self.smtp_port)
    }
}

struct TestServer {
    daemon: Child,
    data_dir: PathBuf,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.daemon.kill();
        let _ = self.daemon.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

/// Boots the daemon on loopback test ports with two bootstrap users
/// (alice and bob, both in example.com) and hands the test sockets plus
/// a context for direct database setup. Each scenario gets its own port
/// base so a lingering socket from the previous daemon cannot bite.
pub fn with_daemon(
    port_base: u16,
    mut fx: impl FnMut(&mut TcpStream, &mut TcpStream, &TestCtx) -> Result<()>,
) -> Result<()> {
    let smtp_port = port_base;
    let imap_port = port_base + 1;
    let data_dir = std::env::temp_dir().join(format!(
        "paquebot-behavior-{}-{}",
        port_base,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let config_path = data_dir.join("paquebot.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
hostname = "mail.example.com"
data_dir = "{data}"

[smtp]
bind_submission = "127.0.0.1:{smtp}"

[imap]
bind = "127.0.0.1:{imap}"

[[bootstrap_domains]]
name = "example.com"

[[bootstrap_users]]
address = "alice@example.com"
password = "plain:hunter2"
display_name = "Alice"

[[bootstrap_users]]
address = "bob@example.com"
password = "plain:hunter2"
display_name = "Bob"
"#,
            data = data_dir.display(),
            smtp = smtp_port,
            imap = imap_port,
        ),
    )?;

    let daemon = Command::new(env!("CARGO_BIN_EXE_paquebot"))
        .arg("--config-file")
        .arg(&config_path)
        .arg("daemon")
        .spawn()
        .context("spawning the daemon")?;
    let server = TestServer {
        daemon,
        data_dir: data_dir.clone(),
    };

    // wait for both listeners
    let mut imap_socket = wait_for_port(imap_port)?;
    let mut smtp_socket = wait_for_port(smtp_port)?;

    let ctx = TestCtx {
        data_dir,
        smtp_port,
        imap_port,
    };

    println!("-- ready to test features --");
    let result = fx(&mut imap_socket, &mut smtp_socket, &ctx);
    println!("-- test teardown --");

    drop(server);
    result.context("all tests passed")
}

fn connect(port: u16) -> Result<TcpStream> {
    let socket = TcpStream::connect(("127.0.0.1", port))?;
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;
    Ok(socket)
}

fn wait_for_port(port: u16) -> Result<TcpStream> {
    let mut max_retry = 100;
    loop {
        max_retry -= 1;
        match (connect(port), max_retry) {
            (Err(e), 0) => bail!("port {} never came up, last error: {}", port, e),
            (Err(_), _) => thread::sleep(SMALL_DELAY),
            (Ok(socket), _) => return Ok(socket),
        }
    }
}

/// Reads until the buffer ends with CRLF and, when given, contains the
/// stop marker.
pub fn read_lines<'a, F: Read>(
    reader: &mut F,
    buffer: &'a mut [u8],
    stop_marker: Option<&[u8]>,
) -> Result<&'a [u8]> {
    let mut nbytes = 0;
    loop {
        nbytes += reader.read(&mut buffer[nbytes..])?;
        let pre_condition = match stop_marker {
            None => true,
            Some(mark) => buffer[..nbytes].windows(mark.len()).any(|w| w == mark),
        };
        if pre_condition && nbytes >= 2 && &buffer[nbytes - 2..nbytes] == &b"\r\n"[..] {
            break;
        }
    }
    println!("read: {}", String::from_utf8_lossy(&buffer[..nbytes]));
    Ok(&buffer[..nbytes])
}

pub fn write_line<W: Write>(writer: &mut W, line: &str) -> Result<()> {
    println!("send: {}", line);
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")?;
    Ok(())
}
