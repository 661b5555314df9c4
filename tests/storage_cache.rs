use chrono::{TimeZone, Utc};
use plume::model::{Address, Attachment, Message};
use plume::types::{SyncState, SyncStatus};
use plume::Store;

fn message(uid: u32, subject: &str) -> Message {
    let mut msg = Message {
        uid,
        folder: "INBOX".to_string(),
        account_id: "a@x.com".to_string(),
        message_id: format!("<{}@example.com>", uid),
        subject: subject.to_string(),
        sender: Address {
            name: "Alice A".to_string(),
            email: "alice@example.com".to_string(),
        },
        to: vec![Address {
            name: String::new(),
            email: "bob@example.org".to_string(),
        }],
        date: Utc.with_ymd_and_hms(2026, 8, 20, 9, 30, 0).single(),
        flags: vec!["\\Seen".to_string()],
        body_text: "hello".to_string(),
        ..Message::default()
    };
    msg.derive_fields();
    msg
}

#[tokio::test]
async fn upsert_and_read_back_round_trips() {
    let store = Store::open_in_memory().await.expect("open");
    let mut original = message(101, "Quarterly report");
    original.attachments = vec![Attachment {
        filename: "q3.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        size: 1024,
        part_id: "2".to_string(),
        is_inline: false,
        content_id: String::new(),
        downloaded: false,
        local_path: String::new(),
    }];
    original.has_attachments = true;
    original.references = vec!["root@example.com".to_string()];

    store
        .upsert_messages(&[original.clone()], "INBOX", "a@x.com")
        .await
        .expect("upsert");

    let loaded = store
        .get_message(101, "INBOX", "a@x.com")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded, original);

    // Upserting the same identity again replaces rather than duplicates.
    let mut updated = original.clone();
    updated.subject = "Quarterly report v2".to_string();
    store
        .upsert_messages(&[updated], "INBOX", "a@x.com")
        .await
        .expect("second upsert");
    let all = store
        .get_messages("INBOX", "a@x.com", 50, 0)
        .await
        .expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].subject, "Quarterly report v2");
}

#[tokio::test]
async fn get_messages_orders_newest_first_and_hides_deleted() {
    let store = Store::open_in_memory().await.expect("open");
    let mut older = message(1, "old");
    older.date = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single();
    let newer = message(2, "new");
    let mut deleted = message(3, "gone");
    deleted.flags.push("\\Deleted".to_string());
    deleted.derive_fields();

    store
        .upsert_messages(&[older, newer, deleted], "INBOX", "a@x.com")
        .await
        .expect("upsert");

    let listed = store
        .get_messages("INBOX", "a@x.com", 50, 0)
        .await
        .expect("list");
    assert_eq!(
        listed.iter().map(|m| m.uid).collect::<Vec<_>>(),
        vec![2, 1]
    );
}

#[tokio::test]
async fn reconcile_deletes_stale_and_upserts_rest() {
    let store = Store::open_in_memory().await.expect("open");
    let mut stale = message(1, "one");
    stale.has_attachments = true;
    stale.attachments = vec![Attachment {
        filename: "old.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        size: 512,
        part_id: "2".to_string(),
        ..Attachment::default()
    }];
    store
        .upsert_messages(
            &[stale, message(2, "two"), message(3, "three")],
            "INBOX",
            "a@x.com",
        )
        .await
        .expect("seed");
    assert_eq!(
        store
            .attachment_count("INBOX", "a@x.com")
            .await
            .expect("count"),
        1
    );

    let server = vec![message(2, "two"), message(3, "three"), message(4, "four")];
    let deleted = store
        .reconcile("INBOX", "a@x.com", &server)
        .await
        .expect("reconcile");
    assert_eq!(deleted, 1);

    let mut uids: Vec<u32> = store
        .get_messages("INBOX", "a@x.com", 50, 0)
        .await
        .expect("list")
        .iter()
        .map(|m| m.uid)
        .collect();
    uids.sort_unstable();
    assert_eq!(uids, vec![2, 3, 4]);

    // uid 1's attachment rows went with it.
    assert_eq!(
        store
            .attachment_count("INBOX", "a@x.com")
            .await
            .expect("count"),
        0
    );

    // Running the same reconcile again changes nothing.
    let deleted = store
        .reconcile("INBOX", "a@x.com", &server)
        .await
        .expect("reconcile again");
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn reconcile_is_scoped_to_one_folder() {
    let store = Store::open_in_memory().await.expect("open");
    store
        .upsert_messages(&[message(1, "inbox mail")], "INBOX", "a@x.com")
        .await
        .expect("seed inbox");
    store
        .upsert_messages(&[message(1, "archived mail")], "Archive", "a@x.com")
        .await
        .expect("seed archive");

    store
        .reconcile("INBOX", "a@x.com", &[])
        .await
        .expect("reconcile empty inbox");

    assert!(store
        .get_messages("INBOX", "a@x.com", 50, 0)
        .await
        .expect("inbox")
        .is_empty());
    assert_eq!(
        store
            .get_messages("Archive", "a@x.com", 50, 0)
            .await
            .expect("archive")
            .len(),
        1
    );
}

#[tokio::test]
async fn read_status_updates_flags_and_booleans() {
    let store = Store::open_in_memory().await.expect("open");
    store
        .upsert_messages(&[message(5, "subject")], "INBOX", "a@x.com")
        .await
        .expect("upsert");

    store
        .update_read_status(5, "INBOX", "a@x.com", false)
        .await
        .expect("mark unread");
    let msg = store
        .get_message(5, "INBOX", "a@x.com")
        .await
        .expect("get")
        .expect("present");
    assert!(!msg.is_read);
    assert!(!msg.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen")));

    store
        .update_read_status(5, "INBOX", "a@x.com", true)
        .await
        .expect("mark read");
    let msg = store
        .get_message(5, "INBOX", "a@x.com")
        .await
        .expect("get")
        .expect("present");
    assert!(msg.is_read);
}

#[tokio::test]
async fn update_body_backfills_without_touching_other_fields() {
    let store = Store::open_in_memory().await.expect("open");
    store
        .upsert_messages(&[message(7, "subject")], "INBOX", "a@x.com")
        .await
        .expect("upsert");

    store
        .update_body(7, "INBOX", "a@x.com", "plain body", "<p>html body</p>")
        .await
        .expect("update body");

    let msg = store
        .get_message(7, "INBOX", "a@x.com")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(msg.body_text, "plain body");
    assert_eq!(msg.body_html, "<p>html body</p>");
    assert_eq!(msg.subject, "subject");
}

#[tokio::test]
async fn search_matches_case_insensitively_across_fields() {
    let store = Store::open_in_memory().await.expect("open");
    let mut by_body = message(1, "unrelated");
    by_body.body_text = "the BUDGET spreadsheet is attached".to_string();
    let by_subject = message(2, "Budget review");
    let other = message(3, "lunch plans");
    store
        .upsert_messages(&[by_body, by_subject, other], "INBOX", "a@x.com")
        .await
        .expect("upsert");

    let hits = store
        .search("budget", "INBOX", "a@x.com")
        .await
        .expect("search");
    let mut uids: Vec<u32> = hits.iter().map(|m| m.uid).collect();
    uids.sort_unstable();
    assert_eq!(uids, vec![1, 2]);

    let by_sender = store
        .search("alice@", "INBOX", "a@x.com")
        .await
        .expect("sender search");
    assert_eq!(by_sender.len(), 3);
}

#[tokio::test]
async fn search_treats_like_metacharacters_literally() {
    let store = Store::open_in_memory().await.expect("open");
    let exact = message(1, "Sale: 100% off");
    let decoy = message(2, "Sale: 1000 items");
    let mut underscore = message(3, "release v1_2");
    underscore.body_text = String::new();
    let mut underscore_decoy = message(4, "release v132");
    underscore_decoy.body_text = String::new();
    store
        .upsert_messages(
            &[exact, decoy, underscore, underscore_decoy],
            "INBOX",
            "a@x.com",
        )
        .await
        .expect("upsert");

    let percent = store
        .search("100%", "INBOX", "a@x.com")
        .await
        .expect("percent search");
    assert_eq!(
        percent.iter().map(|m| m.uid).collect::<Vec<_>>(),
        vec![1]
    );

    let underscore_hits = store
        .search("v1_2", "INBOX", "a@x.com")
        .await
        .expect("underscore search");
    assert_eq!(
        underscore_hits.iter().map(|m| m.uid).collect::<Vec<_>>(),
        vec![3]
    );
}

#[tokio::test]
async fn sync_status_round_trips_and_error_counter_accumulates() {
    let store = Store::open_in_memory().await.expect("open");
    assert!(store
        .get_sync_status("a@x.com", "INBOX")
        .await
        .expect("absent")
        .is_none());

    store
        .upsert_sync_status(&SyncStatus {
            account_id: "a@x.com".to_string(),
            folder: "INBOX".to_string(),
            last_sync_ts: Some(1_700_000_000),
            highest_uid: 4101,
            message_count: 200,
            error_count: 0,
            state: SyncState::Idle,
        })
        .await
        .expect("upsert");

    let status = store
        .get_sync_status("a@x.com", "INBOX")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(status.highest_uid, 4101);
    assert_eq!(status.message_count, 200);
    assert_eq!(status.state, SyncState::Idle);

    store
        .record_sync_error("a@x.com", "INBOX")
        .await
        .expect("first error");
    store
        .record_sync_error("a@x.com", "INBOX")
        .await
        .expect("second error");
    let status = store
        .get_sync_status("a@x.com", "INBOX")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(status.error_count, 2);
    assert_eq!(status.state, SyncState::Error);
}
