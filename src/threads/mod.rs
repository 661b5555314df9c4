//! Conversation grouping.
//!
//! Threads are derived on demand from a folder's message set, never stored as
//! authoritative state. Reference-chain matches take precedence over
//! normalized-subject matches; a message lands in exactly one thread per
//! grouping pass.

use std::collections::HashSet;

use crate::model::{Message, Thread};

/// Partitions messages into threads.
///
/// For each message, in order of precedence:
/// 1. attach to a thread where the message's own id appears in a member's
///    reference list, or a member's id appears in the message's references;
/// 2. attach to a thread whose normalized subject matches (case-insensitive);
/// 3. start a new thread keyed by the message's normalized subject.
///
/// Output threads are sorted by latest member date descending; threads with
/// no dated message sort last. O(n·m) in messages × threads, acceptable for
/// the bounded batches a folder fetch produces.
pub fn group_messages(messages: Vec<Message>) -> Vec<Thread> {
    let mut threads: Vec<Thread> = Vec::new();

    for message in messages {
        let slot = find_by_references(&threads, &message)
            .or_else(|| find_by_subject(&threads, &message));

        match slot {
            Some(idx) => attach(&mut threads[idx], message),
            None => {
                let mut thread = Thread {
                    subject: message.thread_subject.clone(),
                    ..Thread::default()
                };
                attach(&mut thread, message);
                threads.push(thread);
            }
        }
    }

    // Latest activity first; undated threads last.
    threads.sort_by(|a, b| match (a.latest, b.latest) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    threads
}

fn find_by_references(threads: &[Thread], message: &Message) -> Option<usize> {
    if message.message_id.is_empty() && message.references.is_empty() {
        return None;
    }
    let own_refs: HashSet<&str> = message.references.iter().map(String::as_str).collect();

    threads.iter().position(|thread| {
        thread.messages.iter().any(|member| {
            let member_links_back = !message.message_id.is_empty()
                && member
                    .references
                    .iter()
                    .any(|r| r == &message.message_id);
            let message_links_forward =
                !member.message_id.is_empty() && own_refs.contains(member.message_id.as_str());
            member_links_back || message_links_forward
        })
    })
}

fn find_by_subject(threads: &[Thread], message: &Message) -> Option<usize> {
    if message.thread_subject.is_empty() {
        return None;
    }
    threads
        .iter()
        .position(|t| t.subject.eq_ignore_ascii_case(&message.thread_subject))
}

fn attach(thread: &mut Thread, message: Message) {
    for addr in std::iter::once(&message.sender)
        .chain(&message.to)
        .chain(&message.cc)
        .chain(&message.bcc)
    {
        if !addr.email.is_empty() {
            // Later entries overwrite earlier names for the same address.
            thread
                .participants
                .insert(addr.email.clone(), addr.display().to_string());
        }
    }

    if !message.is_read {
        thread.unread_count += 1;
    }
    thread.is_flagged |= message.is_flagged;
    thread.has_attachments |= message.has_attachments;

    if let Some(date) = message.date {
        thread.earliest = Some(thread.earliest.map_or(date, |e| e.min(date)));
        thread.latest = Some(thread.latest.map_or(date, |l| l.max(date)));
    }

    thread.messages.push(message);
    thread.messages.sort_by_key(|m| m.date);
}
