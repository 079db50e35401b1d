use std::path::PathBuf;
use std::sync::Arc;

use paq_mail::flags::{FlagSet, FLAG_DELETED, FLAG_SEEN};
use paq_mail::store::MailStore;
use paq_user::db::Db;
use paq_user::directory::{Directory, INBOX};
use paq_user::model::User;

struct Fixture {
    data_dir: PathBuf,
    store: MailStore,
    user: User,
}

async fn fixture(name: &str) -> Fixture {
    let data_dir = std::env::temp_dir().join(format!(
        "paq-mail-test-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&data_dir);
    std::fs::create_dir_all(&data_dir).unwrap();

    let db = Db::open(&data_dir.join("mail.db")).unwrap();
    let directory = Arc::new(Directory::new(db));
    let domain = directory
        .create_domain("example.com", "mail", None)
        .await
        .unwrap();
    let user = directory
        .create_user(domain.id, "alice", "$argon2id$fake", "Alice", 0)
        .await
        .unwrap();
    let store = MailStore::new(&data_dir, directory);
    store.provision_user(user.id).await.unwrap();
    Fixture {
        data_dir,
        store,
        user,
    }
}

const MESSAGE: &[u8] = b"Subject: hello\r\nFrom: a@a.a\r\nTo: b@b.b\r\n\r\nhello world\r\n";

#[tokio::test]
async fn append_assigns_increasing_uids_and_files_exist() {
    let fx = fixture("append").await;
    let inbox = fx
        .store
        .open_mailbox(fx.user.id, INBOX)
        .await
        .unwrap()
        .unwrap();

    let mut last_uid = 0;
    for _ in 0..5 {
        let (_validity, uid) = inbox
            .append(MESSAGE, &FlagSet::new(), None, true)
            .await
            .unwrap();
        assert!(uid > last_uid);
        last_uid = uid;
    }

    let snapshot = inbox.snapshot().await.unwrap();
    assert_eq!(snapshot.exists(), 5);
    assert_eq!(snapshot.recent(), 5);
    assert!(snapshot.uidnext > last_uid);

    // every indexed message has a backing file, tmp is empty
    let report = fx.store.reconcile(fx.user.id).await.unwrap();
    assert_eq!(report.missing_files, 0);
    assert_eq!(report.orphan_files, 0);
    let tmp = fx
        .data_dir
        .join("maildir")
        .join(format!("user_{}", fx.user.id))
        .join("INBOX")
        .join("tmp");
    assert_eq!(std::fs::read_dir(tmp).unwrap().count(), 0);
}

#[tokio::test]
async fn flag_updates_rename_files() {
    use paq_mail::flags::FLAG_FLAGGED;

    let fx = fixture("flags").await;
    let inbox = fx
        .store
        .open_mailbox(fx.user.id, INBOX)
        .await
        .unwrap()
        .unwrap();
    let (_v, uid) = inbox
        .append(MESSAGE, &FlagSet::new(), None, true)
        .await
        .unwrap();

    let maildir = fx
        .data_dir
        .join("maildir")
        .join(format!("user_{}", fx.user.id))
        .join("INBOX");
    let listing = |sub: &str| -> Vec<String> {
        std::fs::read_dir(maildir.join(sub))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    };

    // a non-Seen flag leaves the message in new/
    let updated = inbox.add_flags(uid, &[FLAG_FLAGGED]).await.unwrap().unwrap();
    assert_eq!(updated.flags, "F");
    assert_eq!(listing("new").len(), 1);
    assert_eq!(listing("cur").len(), 0);

    // \Seen moves it to cur/ with the full suffix
    let updated = inbox.add_flags(uid, &[FLAG_SEEN]).await.unwrap().unwrap();
    assert_eq!(updated.flags, "FS");
    let cur = listing("cur");
    assert_eq!(cur.len(), 1);
    assert!(cur[0].ends_with(":2,FS"), "got {:?}", cur);
    assert_eq!(listing("new").len(), 0);

    // clearing \Seen moves it back to new/ even with flags remaining
    let updated = inbox.remove_flags(uid, &[FLAG_SEEN]).await.unwrap().unwrap();
    assert_eq!(updated.flags, "F");
    assert_eq!(listing("new").len(), 1);
    assert_eq!(listing("cur").len(), 0);
}

#[tokio::test]
async fn expunge_returns_ascending_uids_and_updates_quota() {
    let fx = fixture("expunge").await;
    let inbox = fx
        .store
        .open_mailbox(fx.user.id, INBOX)
        .await
        .unwrap()
        .unwrap();
    let mut uids = Vec::new();
    for _ in 0..4 {
        let (_v, uid) = inbox
            .append(MESSAGE, &FlagSet::new(), None, true)
            .await
            .unwrap();
        uids.push(uid);
    }
    inbox.add_flags(uids[0], &[FLAG_DELETED]).await.unwrap();
    inbox.add_flags(uids[2], &[FLAG_DELETED]).await.unwrap();

    let expunged = inbox.expunge(None).await.unwrap();
    assert_eq!(expunged, vec![uids[0], uids[2]]);
    assert_eq!(inbox.snapshot().await.unwrap().exists(), 2);

    let used = fx
        .store
        .directory()
        .user_by_id(fx.user.id)
        .await
        .unwrap()
        .unwrap()
        .used_bytes;
    assert_eq!(used, 2 * MESSAGE.len() as i64);
}

#[tokio::test]
async fn copy_allocates_new_uid_and_drops_recent() {
    let fx = fixture("copy").await;
    let inbox = fx
        .store
        .open_mailbox(fx.user.id, INBOX)
        .await
        .unwrap()
        .unwrap();
    let archive = fx
        .store
        .open_mailbox(fx.user.id, "Archive")
        .await
        .unwrap()
        .unwrap();

    let (_v, uid) = inbox
        .append(MESSAGE, &FlagSet::new(), None, true)
        .await
        .unwrap();
    let new_uid = inbox.copy_to(&archive, uid).await.unwrap().unwrap();

    let snapshot = archive.snapshot().await.unwrap();
    assert_eq!(snapshot.exists(), 1);
    assert_eq!(snapshot.recent(), 0);
    assert_eq!(snapshot.messages[0].uid, new_uid);
    let copied = archive.read(new_uid).await.unwrap();
    assert_eq!(copied, MESSAGE);
}

#[tokio::test]
async fn search_combines_index_and_envelope() {
    use paq_mail::search::SearchCriteria;

    let fx = fixture("search").await;
    let inbox = fx
        .store
        .open_mailbox(fx.user.id, INBOX)
        .await
        .unwrap()
        .unwrap();

    let (_v, team_uid) = inbox
        .append(
            b"Subject: Team sync\r\nFrom: boss@example.com\r\n\r\nagenda\r\n",
            &FlagSet::new(),
            None,
            true,
        )
        .await
        .unwrap();
    let (_v, lunch_uid) = inbox
        .append(
            b"Subject: lunch?\r\nFrom: pal@example.com\r\n\r\nnoodles\r\n",
            &FlagSet::new(),
            None,
            true,
        )
        .await
        .unwrap();
    inbox.add_flags(lunch_uid, &[FLAG_SEEN]).await.unwrap();

    let found = inbox
        .search(&SearchCriteria {
            subject_contains: Some("team".into()),
            ..SearchCriteria::default()
        })
        .await
        .unwrap();
    assert_eq!(found, vec![team_uid]);

    let found = inbox
        .search(&SearchCriteria {
            without_flags: paq_mail::flags::FlagSet::from_stored("S"),
            ..SearchCriteria::default()
        })
        .await
        .unwrap();
    assert_eq!(found, vec![team_uid]);

    let found = inbox
        .search(&SearchCriteria {
            from_contains: Some("pal@".into()),
            ..SearchCriteria::default()
        })
        .await
        .unwrap();
    assert_eq!(found, vec![lunch_uid]);
}

#[tokio::test]
async fn rename_moves_the_tree() {
    let fx = fixture("rename").await;
    let mbx = fx.store.create_mailbox(fx.user.id, "Team").await.unwrap();
    let team = fx.store.open_row(mbx);
    team.append(MESSAGE, &FlagSet::new(), None, true)
        .await
        .unwrap();

    fx.store
        .rename_mailbox(fx.user.id, "Team", "Team/2024")
        .await
        .unwrap();
    let renamed = fx
        .store
        .open_mailbox(fx.user.id, "Team/2024")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.snapshot().await.unwrap().exists(), 1);
    assert!(fx
        .store
        .open_mailbox(fx.user.id, "Team")
        .await
        .unwrap()
        .is_none());
}
