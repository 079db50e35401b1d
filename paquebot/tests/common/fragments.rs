//! Hand-written protocol fragments. These are not a generic client:
//! every exchange is spelled out so the expected traffic stays obvious.

use std::net::TcpStream;

use anyhow::{ensure, Result};
use base64::Engine;

use crate::common::{read_lines, write_line};

pub const EMAIL_BODY: &str = "Hello Bob,\r\nthis is a test message.\r\n";

// ---- SMTP ----

pub fn smtp_handshake(smtp: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    let read = read_lines(smtp, &mut buffer, None)?;
    ensure!(read.starts_with(b"220 "), "SMTP greeting expected");

    write_line(smtp, "EHLO tester.local")?;
    let read = read_lines(smtp, &mut buffer, Some(b"250 "))?;
    let ehlo = String::from_utf8_lossy(read);
    ensure!(ehlo.contains("AUTH PLAIN"), "AUTH must be offered");
    ensure!(ehlo.contains("SIZE"), "SIZE must be offered");
    Ok(())
}

pub fn smtp_auth_plain(smtp: &mut TcpStream, user: &str, password: &str) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    let payload = format!("\0{}\0{}", user, password);
    let b64 = base64::engine::general_purpose::STANDARD.encode(payload);
    write_line(smtp, &format!("AUTH PLAIN {}", b64))?;
    let read = read_lines(smtp, &mut buffer, None)?;
    ensure!(read.starts_with(b"235 "), "authentication must succeed");
    Ok(())
}

pub fn smtp_send(
    smtp: &mut TcpStream,
    from: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];

    write_line(smtp, &format!("MAIL FROM:<{}>", from))?;
    let read = read_lines(smtp, &mut buffer, None)?;
    ensure!(read.starts_with(b"250 "), "MAIL FROM must be accepted");

    write_line(smtp, &format!("RCPT TO:<{}>", to))?;
    let read = read_lines(smtp, &mut buffer, None)?;
    ensure!(read.starts_with(b"250 "), "RCPT TO must be accepted");

    write_line(smtp, "DATA")?;
    let read = read_lines(smtp, &mut buffer, None)?;
    ensure!(read.starts_with(b"354 "), "DATA must be accepted");

    write_line(smtp, &format!("From: <{}>", from))?;
    write_line(smtp, &format!("To: <{}>", to))?;
    write_line(smtp, &format!("Subject: {}", subject))?;
    write_line(smtp, "")?;
    for line in body.split("\r\n") {
        write_line(smtp, line)?;
    }
    write_line(smtp, ".")?;
    let read = read_lines(smtp, &mut buffer, None)?;
    ensure!(read.starts_with(b"250 "), "message must be accepted");
    Ok(())
}

pub fn smtp_quit(smtp: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(smtp, "QUIT")?;
    let read = read_lines(smtp, &mut buffer, None)?;
    ensure!(read.starts_with(b"221 "), "QUIT must be acknowledged");
    Ok(())
}

// ---- IMAP ----

pub fn imap_connect(imap: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    let read = read_lines(imap, &mut buffer, None)?;
    ensure!(read.starts_with(b"* OK"), "IMAP greeting expected");
    let greeting = String::from_utf8_lossy(read);
    ensure!(greeting.contains("IMAP4REV1"), "capability in greeting");
    ensure!(greeting.contains("IDLE"), "IDLE capability in greeting");
    Ok(())
}

pub fn imap_login(imap: &mut TcpStream, user: &str, password: &str) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, &format!("l1 LOGIN {} {}", user, password))?;
    let read = read_lines(imap, &mut buffer, Some(b"l1 "))?;
    ensure!(
        String::from_utf8_lossy(read).contains("l1 OK"),
        "login must succeed"
    );
    Ok(())
}

/// Returns the untagged part of the SELECT response.
pub fn imap_select(imap: &mut TcpStream, mailbox: &str) -> Result<String> {
    let mut buffer: [u8; 4096] = [0; 4096];
    write_line(imap, &format!("s1 SELECT {}", mailbox))?;
    let read = read_lines(imap, &mut buffer, Some(b"s1 "))?;
    let text = String::from_utf8_lossy(read).into_owned();
    ensure!(text.contains("s1 OK"), "select must succeed: {}", text);
    ensure!(text.contains("EXISTS"), "select reports EXISTS");
    ensure!(text.contains("UIDVALIDITY"), "select reports UIDVALIDITY");
    Ok(text)
}

pub fn imap_fetch_rfc822(imap: &mut TcpStream, seq: u32) -> Result<String> {
    let mut buffer = vec![0; 64 * 1024];
    write_line(imap, &format!("f1 UID FETCH {} (RFC822)", seq))?;
    let read = read_lines(imap, &mut buffer, Some(b"f1 "))?;
    let text = String::from_utf8_lossy(read).into_owned();
    ensure!(text.contains("f1 OK"), "fetch must succeed: {}", text);
    Ok(text)
}

pub fn imap_fetch_flags(imap: &mut TcpStream, seq: u32) -> Result<String> {
    let mut buffer: [u8; 4096] = [0; 4096];
    write_line(imap, &format!("f2 FETCH {} (FLAGS)", seq))?;
    let read = read_lines(imap, &mut buffer, Some(b"f2 "))?;
    let text = String::from_utf8_lossy(read).into_owned();
    ensure!(text.contains("f2 OK"), "fetch must succeed: {}", text);
    Ok(text)
}

pub fn imap_search_subject(imap: &mut TcpStream, needle: &str) -> Result<String> {
    let mut buffer: [u8; 4096] = [0; 4096];
    write_line(imap, &format!("k1 SEARCH SUBJECT {}", needle))?;
    let read = read_lines(imap, &mut buffer, Some(b"k1 "))?;
    let text = String::from_utf8_lossy(read).into_owned();
    ensure!(text.contains("* SEARCH"), "search reply expected: {}", text);
    ensure!(text.contains("k1 OK"), "search must succeed: {}", text);
    Ok(text)
}

pub fn imap_store_deleted(imap: &mut TcpStream, seq: u32) -> Result<()> {
    let mut buffer: [u8; 4096] = [0; 4096];
    write_line(imap, &format!("t1 STORE {} +FLAGS (\\Deleted)", seq))?;
    let read = read_lines(imap, &mut buffer, Some(b"t1 "))?;
    ensure!(
        String::from_utf8_lossy(read).contains("t1 OK"),
        "store must succeed"
    );
    Ok(())
}

pub fn imap_expunge(imap: &mut TcpStream) -> Result<String> {
    let mut buffer: [u8; 4096] = [0; 4096];
    write_line(imap, "e1 EXPUNGE")?;
    let read = read_lines(imap, &mut buffer, Some(b"e1 "))?;
    let text = String::from_utf8_lossy(read).into_owned();
    ensure!(text.contains("e1 OK"), "expunge must succeed: {}", text);
    Ok(text)
}

pub fn imap_idle_start(imap: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, "i1 IDLE")?;
    let read = read_lines(imap, &mut buffer, None)?;
    ensure!(read.starts_with(b"+ "), "IDLE continuation expected");
    Ok(())
}

/// Blocks until the idling session receives an EXISTS update.
pub fn imap_idle_wait_exists(imap: &mut TcpStream) -> Result<String> {
    let mut buffer: [u8; 4096] = [0; 4096];
    let read = read_lines(imap, &mut buffer, Some(b"EXISTS"))?;
    Ok(String::from_utf8_lossy(read).into_owned())
}

pub fn imap_idle_done(imap: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, "DONE")?;
    let read = read_lines(imap, &mut buffer, Some(b"i1 "))?;
    ensure!(
        String::from_utf8_lossy(read).contains("i1 OK"),
        "IDLE must complete"
    );
    Ok(())
}

pub fn imap_logout(imap: &mut TcpStream) -> Result<()> {
    let mut buffer: [u8; 1500] = [0; 1500];
    write_line(imap, "z1 LOGOUT")?;
    let _ = read_lines(imap, &mut buffer, Some(b"* BYE"))?;
    Ok(())
}
