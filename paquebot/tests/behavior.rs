use anyhow::{ensure, Context, Result};

mod common;
use crate::common::fragments::*;
use crate::common::*;

fn main() {
    submit_and_deliver_locally();
    sieve_fileinto();
    idle_notification();
    deleted_flag_and_expunge();
    println!("behavior tests passed");
}

/// Authenticated submission on the submission port ends in bob's INBOX
/// and in alice's Sent mailbox (already \Seen there).
fn submit_and_deliver_locally() {
    println!("=== submit_and_deliver_locally");
    with_daemon(41200, |imap_socket, smtp_socket, ctx| {
        smtp_handshake(smtp_socket).context("server says hello")?;
        smtp_auth_plain(smtp_socket, "alice@example.com", "hunter2").context("alice logs in")?;
        smtp_send(
            smtp_socket,
            "alice@example.com",
            "bob@example.com",
            "greetings",
            EMAIL_BODY,
        )
        .context("mail accepted")?;
        smtp_quit(smtp_socket).context("quit")?;

        // bob finds the message in INBOX
        imap_connect(imap_socket).context("imap greets")?;
        imap_login(imap_socket, "bob@example.com", "hunter2").context("bob logs in")?;
        let select = imap_select(imap_socket, "INBOX").context("select inbox")?;
        ensure!(select.contains("* 1 EXISTS"), "one message: {}", select);
        ensure!(select.contains("* 1 RECENT"), "one recent: {}", select);
        let fetched = imap_fetch_rfc822(imap_socket, 1).context("fetch body")?;
        ensure!(fetched.contains("this is a test message"), "body matches");
        ensure!(fetched.contains("Subject: greetings"), "subject matches");
        ensure!(
            fetched.contains("Received: from tester.local"),
            "trace header present"
        );
        imap_logout(imap_socket).context("bob logs out")?;

        // alice has a copy in Sent, already seen
        let mut alice = ctx.connect_imap()?;
        imap_connect(&mut alice)?;
        imap_login(&mut alice, "alice@example.com", "hunter2").context("alice logs in")?;
        let select = imap_select(&mut alice, "Sent").context("select sent")?;
        ensure!(select.contains("* 1 EXISTS"), "sent copy exists: {}", select);
        let flags = imap_fetch_flags(&mut alice, 1)?;
        ensure!(flags.contains("\\Seen"), "sent copy is seen: {}", flags);
        imap_logout(&mut alice)?;
        Ok(())
    })
    .expect("test fully run");
}

/// An active sieve script files matching mail into the named mailbox
/// instead of INBOX, creating it on demand.
fn sieve_fileinto() {
    println!("=== sieve_fileinto");
    with_daemon(41210, |imap_socket, smtp_socket, ctx| {
        // install bob's script straight through the metadata index
        let db_path = ctx.data_dir.join("mail.db");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let directory =
                paq_user::directory::Directory::new(paq_user::db::Db::open(&db_path)?);
            let bob = directory
                .user_by_address(&"bob@example.com".parse()?)
                .await?
                .context("bob exists")?;
            directory
                .upsert_sieve_script(
                    bob.id,
                    "filters",
                    "require [\"fileinto\"];\nif header :contains \"Subject\" \"team\" { fileinto \"Team\"; }\n",
                )
                .await?;
            directory.activate_sieve_script(bob.id, "filters").await?;
            anyhow::Ok(())
        })?;

        smtp_handshake(smtp_socket)?;
        smtp_auth_plain(smtp_socket, "alice@example.com", "hunter2")?;
        smtp_send(
            smtp_socket,
            "alice@example.com",
            "bob@example.com",
            "Team sync",
            "agenda attached\r\n",
        )?;
        smtp_quit(smtp_socket)?;

        imap_connect(imap_socket)?;
        imap_login(imap_socket, "bob@example.com", "hunter2")?;
        let select = imap_select(imap_socket, "Team").context("select Team")?;
        ensure!(select.contains("* 1 EXISTS"), "filed into Team: {}", select);
        let select = imap_select(imap_socket, "INBOX").context("select INBOX")?;
        ensure!(select.contains("* 0 EXISTS"), "INBOX stays empty: {}", select);
        imap_logout(imap_socket)?;
        Ok(())
    })
    .expect("test fully run");
}

/// A session in IDLE hears about a concurrent local delivery.
fn idle_notification() {
    println!("=== idle_notification");
    with_daemon(41220, |imap_socket, smtp_socket, _ctx| {
        imap_connect(imap_socket)?;
        imap_login(imap_socket, "alice@example.com", "hunter2")?;
        let select = imap_select(imap_socket, "INBOX")?;
        ensure!(select.contains("* 0 EXISTS"), "inbox starts empty");
        imap_idle_start(imap_socket).context("idle accepted")?;

        // concurrent delivery from bob
        smtp_handshake(smtp_socket)?;
        smtp_auth_plain(smtp_socket, "bob@example.com", "hunter2")?;
        smtp_send(
            smtp_socket,
            "bob@example.com",
            "alice@example.com",
            "wake up",
            "ping\r\n",
        )?;

        let update = imap_idle_wait_exists(imap_socket).context("unsolicited EXISTS")?;
        ensure!(update.contains("* 1 EXISTS"), "exists update: {}", update);
        imap_idle_done(imap_socket).context("DONE completes")?;
        smtp_quit(smtp_socket)?;
        imap_logout(imap_socket)?;
        Ok(())
    })
    .expect("test fully run");
}

/// STORE +FLAGS \Deleted then EXPUNGE removes the message and reports
/// the expunged sequence number.
fn deleted_flag_and_expunge() {
    println!("=== deleted_flag_and_expunge");
    with_daemon(41230, |imap_socket, smtp_socket, _ctx| {
        smtp_handshake(smtp_socket)?;
        smtp_auth_plain(smtp_socket, "alice@example.com", "hunter2")?;
        smtp_send(
            smtp_socket,
            "alice@example.com",
            "bob@example.com",
            "disposable",
            "gone soon\r\n",
        )?;
        smtp_quit(smtp_socket)?;

        imap_connect(imap_socket)?;
        imap_login(imap_socket, "bob@example.com", "hunter2")?;
        let select = imap_select(imap_socket, "INBOX")?;
        ensure!(select.contains("* 1 EXISTS"), "message delivered");

        let found = imap_search_subject(imap_socket, "disposable")?;
        ensure!(found.contains("* SEARCH 1"), "search finds it: {}", found);

        imap_store_deleted(imap_socket, 1)?;
        let expunged = imap_expunge(imap_socket)?;
        ensure!(
            expunged.contains("* 1 EXPUNGE"),
            "expunge reported: {}",
            expunged
        );

        let select = imap_select(imap_socket, "INBOX")?;
        ensure!(select.contains("* 0 EXISTS"), "inbox empty again");
        imap_logout(imap_socket)?;
        Ok(())
    })
    .expect("test fully run");
}
