use crate::ast::{Action, AddressPart, Command, MatchType, Script, Test};
use crate::message::{extract_address, SieveMessage};

/// The result of running a script over one message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub actions: Vec<Action>,
}

impl Outcome {
    /// Mailboxes the message files into (implicit keep → INBOX handled
    /// by the caller through `delivers_to_inbox`).
    pub fn file_into(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::FileInto(m) => Some(m.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn redirects(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::Redirect(addr) => Some(addr.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_discarded(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Discard))
    }

    pub fn reject_reason(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| match a {
            Action::Reject(reason) => Some(reason.as_str()),
            _ => None,
        })
    }

    pub fn vacation(&self) -> Option<(&Option<u32>, &Option<String>, &str)> {
        self.actions.iter().find_map(|a| match a {
            Action::Vacation {
                days,
                subject,
                message,
            } => Some((days, subject, message.as_str())),
            _ => None,
        })
    }

    /// True when the message still lands in INBOX: an explicit keep, or
    /// no terminal action at all (implicit keep).
    pub fn delivers_to_inbox(&self) -> bool {
        if self.actions.iter().any(|a| matches!(a, Action::Keep)) {
            return true;
        }
        !self.actions.iter().any(|a| {
            matches!(
                a,
                Action::FileInto(_) | Action::Redirect(_) | Action::Discard | Action::Reject(_)
            )
        })
    }
}

enum Flow {
    Continue,
    Halt,
}

/// Runs a parsed script against a message. Rules evaluate top to
/// bottom; `stop`, `discard`, `reject`, or a `fileinto`/`redirect`
/// without a following `keep` end the run.
pub fn evaluate(script: &Script, message: &SieveMessage) -> Outcome {
    let mut outcome = Outcome::default();
    let _ = run_block(&script.commands, message, &mut outcome);
    outcome
}

fn run_block(commands: &[Command], message: &SieveMessage, outcome: &mut Outcome) -> Flow {
    // A fileinto/redirect halts the script unless a keep follows it in
    // the same run.
    let mut pending_terminal = false;

    for command in commands {
        match command {
            Command::Stop => return Flow::Halt,
            Command::Keep => {
                outcome.actions.push(Action::Keep);
                pending_terminal = false;
            }
            Command::Discard => {
                outcome.actions.push(Action::Discard);
                return Flow::Halt;
            }
            Command::Reject(reason) => {
                outcome.actions.push(Action::Reject(reason.clone()));
                return Flow::Halt;
            }
            Command::FileInto(mailbox) => {
                outcome.actions.push(Action::FileInto(mailbox.clone()));
                pending_terminal = true;
            }
            Command::Redirect(address) => {
                outcome.actions.push(Action::Redirect(address.clone()));
                pending_terminal = true;
            }
            Command::Vacation {
                days,
                subject,
                message: text,
            } => {
                outcome.actions.push(Action::Vacation {
                    days: *days,
                    subject: subject.clone(),
                    message: text.clone(),
                });
            }
            Command::If {
                branches,
                otherwise,
            } => {
                let mut matched = false;
                for (test, body) in branches {
                    if run_test(test, message) {
                        matched = true;
                        if let Flow::Halt = run_block(body, message, outcome) {
                            return Flow::Halt;
                        }
                        break;
                    }
                }
                if !matched {
                    if let Some(body) = otherwise {
                        if let Flow::Halt = run_block(body, message, outcome) {
                            return Flow::Halt;
                        }
                    }
                }
                // actions applied inside the branch count for the
                // implicit-terminal rule at this level too
                if outcome
                    .actions
                    .iter()
                    .rev()
                    .find(|a| !matches!(a, Action::Vacation { .. }))
                    .map(|a| matches!(a, Action::FileInto(_) | Action::Redirect(_)))
                    .unwrap_or(false)
                {
                    pending_terminal = true;
                } else if outcome.actions.iter().any(|a| matches!(a, Action::Keep)) {
                    pending_terminal = false;
                }
            }
        }
    }

    if pending_terminal {
        Flow::Halt
    } else {
        Flow::Continue
    }
}

fn run_test(test: &Test, message: &SieveMessage) -> bool {
    match test {
        Test::True => true,
        Test::False => false,
        Test::Not(inner) => !run_test(inner, message),
        Test::AllOf(tests) => tests.iter().all(|t| run_test(t, message)),
        Test::AnyOf(tests) => tests.iter().any(|t| run_test(t, message)),
        Test::Exists(headers) => headers.iter().all(|h| message.has_header(h)),
        Test::Size { over, limit } => {
            if *over {
                message.size as u64 > *limit
            } else {
                (message.size as u64) < *limit
            }
        }
        Test::Header {
            match_type,
            headers,
            keys,
        } => headers.iter().any(|h| {
            message
                .header_values(h)
                .iter()
                .any(|value| keys.iter().any(|key| matches(match_type, value, key)))
        }),
        Test::Address {
            part,
            match_type,
            headers,
            keys,
        } => headers.iter().any(|h| {
            message.header_values(h).iter().any(|value| {
                let addr = extract_address(value);
                let candidate = match part {
                    AddressPart::All => addr,
                    AddressPart::LocalPart => addr.split('@').next().unwrap_or(addr),
                    AddressPart::Domain => addr.rsplit('@').next().unwrap_or(""),
                };
                keys.iter().any(|key| matches(match_type, candidate, key))
            })
        }),
    }
}

/// The default comparator is i;ascii-casemap, so every match type is
/// case-insensitive.
fn matches(match_type: &MatchType, value: &str, key: &str) -> bool {
    let value = value.to_lowercase();
    let key = key.to_lowercase();
    match match_type {
        MatchType::Is => value == key,
        MatchType::Contains => value.contains(&key),
        MatchType::Matches => glob_match(&key, &value),
    }
}

/// `*` and `?` wildcard matching, iterative with backtracking.
fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    let (mut star_pi, mut star_ni) = (usize::MAX, 0usize);

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_pi = pi;
            star_ni = ni;
            pi += 1;
        } else if star_pi != usize::MAX {
            pi = star_pi + 1;
            star_ni += 1;
            ni = star_ni;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn msg(raw: &[u8]) -> SieveMessage {
        SieveMessage::parse("alice@example.com", "bob@example.com", raw)
    }

    #[test]
    fn fileinto_on_subject_match() {
        let script = parse(
            "require [\"fileinto\"]; if header :contains \"Subject\" \"team\" { fileinto \"Team\"; }",
        )
        .unwrap();
        let outcome = evaluate(&script, &msg(b"Subject: Team sync\r\n\r\nhi\r\n"));
        assert_eq!(outcome.file_into(), vec!["Team"]);
        assert!(!outcome.delivers_to_inbox());

        let outcome = evaluate(&script, &msg(b"Subject: lunch\r\n\r\nhi\r\n"));
        assert!(outcome.file_into().is_empty());
        assert!(outcome.delivers_to_inbox());
    }

    #[test]
    fn fileinto_followed_by_keep_also_keeps() {
        let script = parse("fileinto \"Team\"; keep;").unwrap();
        let outcome = evaluate(&script, &msg(b"\r\n"));
        assert_eq!(outcome.file_into(), vec!["Team"]);
        assert!(outcome.delivers_to_inbox());
    }

    #[test]
    fn discard_halts_evaluation() {
        let script = parse("discard; fileinto \"Never\";").unwrap();
        let outcome = evaluate(&script, &msg(b"\r\n"));
        assert!(outcome.is_discarded());
        assert!(outcome.file_into().is_empty());
        assert!(!outcome.delivers_to_inbox());
    }

    #[test]
    fn stop_halts_without_terminal_action() {
        let script = parse("if true { stop; } fileinto \"Never\";").unwrap();
        let outcome = evaluate(&script, &msg(b"\r\n"));
        assert!(outcome.file_into().is_empty());
        assert!(outcome.delivers_to_inbox());
    }

    #[test]
    fn elsif_branch_taken_in_order() {
        let script = parse(
            "if size :over 1M { discard; } elsif header :is \"X-Class\" \"junk\" { fileinto \"Junk\"; } else { keep; }",
        )
        .unwrap();
        let outcome = evaluate(&script, &msg(b"X-Class: junk\r\n\r\n"));
        assert_eq!(outcome.file_into(), vec!["Junk"]);
        let outcome = evaluate(&script, &msg(b"X-Class: ham\r\n\r\n"));
        assert!(outcome.delivers_to_inbox());
    }

    #[test]
    fn allof_anyof_not() {
        let script = parse(
            "if allof (exists \"From\", anyof (header :is \"A\" \"1\", header :is \"B\" \"2\"), not false) { fileinto \"X\"; }",
        )
        .unwrap();
        let outcome = evaluate(&script, &msg(b"From: x@y.z\r\nB: 2\r\n\r\n"));
        assert_eq!(outcome.file_into(), vec!["X"]);
        let outcome = evaluate(&script, &msg(b"From: x@y.z\r\nB: 3\r\n\r\n"));
        assert!(outcome.file_into().is_empty());
    }

    #[test]
    fn address_parts() {
        let script = parse(
            "if address :domain :is \"From\" \"example.com\" { fileinto \"Internal\"; }",
        )
        .unwrap();
        let outcome = evaluate(&script, &msg(b"From: Alice <alice@example.com>\r\n\r\n"));
        assert_eq!(outcome.file_into(), vec!["Internal"]);
        let outcome = evaluate(&script, &msg(b"From: Eve <eve@evil.test>\r\n\r\n"));
        assert!(outcome.file_into().is_empty());
    }

    #[test]
    fn matches_glob() {
        assert!(glob_match("*@example.com", "alice@example.com"));
        assert!(glob_match("al?ce*", "alice anything"));
        assert!(!glob_match("*@example.com", "alice@example.org"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn vacation_action_is_surfaced() {
        let script = parse("require \"vacation\"; vacation :days 3 \"away\";").unwrap();
        let outcome = evaluate(&script, &msg(b"Subject: hi\r\n\r\n"));
        let (days, _subject, text) = outcome.vacation().unwrap();
        assert_eq!(*days, Some(3));
        assert_eq!(text, "away");
        // vacation alone is not terminal
        assert!(outcome.delivers_to_inbox());
    }

    #[test]
    fn redirect_is_terminal_without_keep() {
        let script = parse("redirect \"other@example.net\";").unwrap();
        let outcome = evaluate(&script, &msg(b"\r\n"));
        assert_eq!(outcome.redirects(), vec!["other@example.net"]);
        assert!(!outcome.delivers_to_inbox());
    }
}
