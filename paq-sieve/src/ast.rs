use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    pub requires: Vec<String>,
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    If {
        /// `if` plus any number of `elsif` arms, in order.
        branches: Vec<(Test, Vec<Command>)>,
        otherwise: Option<Vec<Command>>,
    },
    Stop,
    Keep,
    Discard,
    Reject(String),
    FileInto(String),
    Redirect(String),
    Vacation {
        days: Option<u32>,
        subject: Option<String>,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Is,
    Contains,
    Matches,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressPart {
    All,
    LocalPart,
    Domain,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Test {
    Address {
        part: AddressPart,
        match_type: MatchType,
        headers: Vec<String>,
        keys: Vec<String>,
    },
    Header {
        match_type: MatchType,
        headers: Vec<String>,
        keys: Vec<String>,
    },
    Exists(Vec<String>),
    Size {
        over: bool,
        limit: u64,
    },
    AllOf(Vec<Test>),
    AnyOf(Vec<Test>),
    Not(Box<Test>),
    True,
    False,
}

/// An action produced by evaluation, in script order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Keep,
    FileInto(String),
    Redirect(String),
    Discard,
    Reject(String),
    Vacation {
        days: Option<u32>,
        subject: Option<String>,
        message: String,
    },
}

// ---- canonical serialization ----
//
// `parse(script.to_string())` is structurally identical to the original
// parse; tests rely on it.

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.requires.is_empty() {
            write!(f, "require [")?;
            write_string_list(f, &self.requires)?;
            writeln!(f, "];")?;
        }
        for cmd in &self.commands {
            write_command(f, cmd, 0)?;
        }
        Ok(())
    }
}

fn indent(f: &mut fmt::Formatter<'_>, level: usize) -> fmt::Result {
    for _ in 0..level {
        write!(f, "    ")?;
    }
    Ok(())
}

fn write_command(f: &mut fmt::Formatter<'_>, cmd: &Command, level: usize) -> fmt::Result {
    indent(f, level)?;
    match cmd {
        Command::If {
            branches,
            otherwise,
        } => {
            for (i, (test, body)) in branches.iter().enumerate() {
                if i > 0 {
                    indent(f, level)?;
                }
                write!(f, "{} ", if i == 0 { "if" } else { "elsif" })?;
                write_test(f, test)?;
                writeln!(f, " {{")?;
                for c in body {
                    write_command(f, c, level + 1)?;
                }
                indent(f, level)?;
                writeln!(f, "}}")?;
            }
            if let Some(body) = otherwise {
                indent(f, level)?;
                writeln!(f, "else {{")?;
                for c in body {
                    write_command(f, c, level + 1)?;
                }
                indent(f, level)?;
                writeln!(f, "}}")?;
            }
            Ok(())
        }
        Command::Stop => writeln!(f, "stop;"),
        Command::Keep => writeln!(f, "keep;"),
        Command::Discard => writeln!(f, "discard;"),
        Command::Reject(reason) => writeln!(f, "reject {};", quoted(reason)),
        Command::FileInto(mailbox) => writeln!(f, "fileinto {};", quoted(mailbox)),
        Command::Redirect(address) => writeln!(f, "redirect {};", quoted(address)),
        Command::Vacation {
            days,
            subject,
            message,
        } => {
            write!(f, "vacation")?;
            if let Some(days) = days {
                write!(f, " :days {}", days)?;
            }
            if let Some(subject) = subject {
                write!(f, " :subject {}", quoted(subject))?;
            }
            writeln!(f, " {};", quoted(message))
        }
    }
}

fn write_test(f: &mut fmt::Formatter<'_>, test: &Test) -> fmt::Result {
    match test {
        Test::Address {
            part,
            match_type,
            headers,
            keys,
        } => {
            write!(f, "address")?;
            match part {
                AddressPart::All => {}
                AddressPart::LocalPart => write!(f, " :localpart")?,
                AddressPart::Domain => write!(f, " :domain")?,
            }
            write_match_type(f, match_type)?;
            write!(f, " [")?;
            write_string_list(f, headers)?;
            write!(f, "] [")?;
            write_string_list(f, keys)?;
            write!(f, "]")
        }
        Test::Header {
            match_type,
            headers,
            keys,
        } => {
            write!(f, "header")?;
            write_match_type(f, match_type)?;
            write!(f, " [")?;
            write_string_list(f, headers)?;
            write!(f, "] [")?;
            write_string_list(f, keys)?;
            write!(f, "]")
        }
        Test::Exists(headers) => {
            write!(f, "exists [")?;
            write_string_list(f, headers)?;
            write!(f, "]")
        }
        Test::Size { over, limit } => {
            write!(f, "size {} {}", if *over { ":over" } else { ":under" }, limit)
        }
        Test::AllOf(tests) => write_test_list(f, "allof", tests),
        Test::AnyOf(tests) => write_test_list(f, "anyof", tests),
        Test::Not(inner) => {
            write!(f, "not ")?;
            write_test(f, inner)
        }
        Test::True => write!(f, "true"),
        Test::False => write!(f, "false"),
    }
}

fn write_test_list(f: &mut fmt::Formatter<'_>, name: &str, tests: &[Test]) -> fmt::Result {
    write!(f, "{} (", name)?;
    for (i, t) in tests.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write_test(f, t)?;
    }
    write!(f, ")")
}

fn write_match_type(f: &mut fmt::Formatter<'_>, match_type: &MatchType) -> fmt::Result {
    match match_type {
        MatchType::Is => write!(f, " :is"),
        MatchType::Contains => write!(f, " :contains"),
        MatchType::Matches => write!(f, " :matches"),
    }
}

fn write_string_list(f: &mut fmt::Formatter<'_>, items: &[String]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", quoted(item))?;
    }
    Ok(())
}

fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
