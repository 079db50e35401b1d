use thiserror::Error;

use crate::ast::{AddressPart, Command, MatchType, Script, Test};
use crate::lexer::{tokenize, Token};
use crate::{MAX_DEPTH, MAX_LIST_LEN};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("script too large ({0} bytes)")]
    ScriptTooLarge(usize),
    #[error("too many tokens")]
    TooManyTokens,
    #[error("string literal too long")]
    StringTooLong,
    #[error("list too long")]
    ListTooLong,
    #[error("nesting too deep")]
    TooDeep,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("bad number")]
    BadNumber,
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("unexpected end of script")]
    UnexpectedEnd,
    #[error("unexpected token near {0}")]
    Unexpected(String),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("unknown test {0:?}")]
    UnknownTest(String),
    #[error("unknown tag :{0}")]
    UnknownTag(String),
}

pub fn parse(input: &str) -> Result<Script, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.script()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Explicit nesting counter covering test nesting and blocks, so a
    /// hostile script cannot ride the host call stack.
    depth: usize,
}

impl Parser {
    fn script(&mut self) -> Result<Script, ParseError> {
        let mut requires = Vec::new();
        let mut commands = Vec::new();
        while !self.at_end() {
            match self.peek()? {
                Token::Identifier(name) if name == "require" => {
                    self.advance();
                    for cap in self.string_list()? {
                        if !requires.contains(&cap) {
                            requires.push(cap);
                        }
                    }
                    self.expect(Token::Semicolon)?;
                }
                _ => commands.push(self.command()?),
            }
        }
        Ok(Script { requires, commands })
    }

    fn command(&mut self) -> Result<Command, ParseError> {
        let name = self.identifier()?;
        match name.as_str() {
            "if" => self.if_command(),
            "stop" => self.bare(Command::Stop),
            "keep" => self.bare(Command::Keep),
            "discard" => self.bare(Command::Discard),
            "reject" => {
                let reason = self.string()?;
                self.expect(Token::Semicolon)?;
                Ok(Command::Reject(reason))
            }
            "fileinto" => {
                let mailbox = self.string()?;
                self.expect(Token::Semicolon)?;
                Ok(Command::FileInto(mailbox))
            }
            "redirect" => {
                let address = self.string()?;
                self.expect(Token::Semicolon)?;
                Ok(Command::Redirect(address))
            }
            "vacation" => self.vacation(),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    fn bare(&mut self, cmd: Command) -> Result<Command, ParseError> {
        self.expect(Token::Semicolon)?;
        Ok(cmd)
    }

    fn if_command(&mut self) -> Result<Command, ParseError> {
        let mut branches = Vec::new();
        let test = self.test()?;
        let body = self.block()?;
        branches.push((test, body));

        let mut otherwise = None;
        loop {
            match self.peek_identifier() {
                Some("elsif") => {
                    self.advance();
                    let test = self.test()?;
                    let body = self.block()?;
                    branches.push((test, body));
                }
                Some("else") => {
                    self.advance();
                    otherwise = Some(self.block()?);
                    break;
                }
                _ => break,
            }
        }
        Ok(Command::If {
            branches,
            otherwise,
        })
    }

    fn vacation(&mut self) -> Result<Command, ParseError> {
        let mut days = None;
        let mut subject = None;
        loop {
            match self.peek()? {
                Token::Tag(tag) => {
                    let tag = tag.clone();
                    self.advance();
                    match tag.as_str() {
                        "days" => match self.next()? {
                            Token::Number(n) => days = Some(n.min(u32::MAX as u64) as u32),
                            _ => return Err(ParseError::BadNumber),
                        },
                        "subject" => subject = Some(self.string()?),
                        other => return Err(ParseError::UnknownTag(other.to_string())),
                    }
                }
                _ => break,
            }
        }
        let message = self.string()?;
        self.expect(Token::Semicolon)?;
        Ok(Command::Vacation {
            days,
            subject,
            message,
        })
    }

    fn block(&mut self) -> Result<Vec<Command>, ParseError> {
        self.enter()?;
        self.expect(Token::BlockOpen)?;
        let mut commands = Vec::new();
        while self.peek()? != &Token::BlockClose {
            commands.push(self.command()?);
        }
        self.advance();
        self.leave();
        Ok(commands)
    }

    fn test(&mut self) -> Result<Test, ParseError> {
        self.enter()?;
        let result = self.test_inner();
        self.leave();
        result
    }

    fn test_inner(&mut self) -> Result<Test, ParseError> {
        let name = self.identifier()?;
        match name.as_str() {
            "true" => Ok(Test::True),
            "false" => Ok(Test::False),
            "not" => Ok(Test::Not(Box::new(self.test()?))),
            "allof" => Ok(Test::AllOf(self.test_list()?)),
            "anyof" => Ok(Test::AnyOf(self.test_list()?)),
            "exists" => Ok(Test::Exists(self.string_list()?)),
            "size" => {
                let over = match self.next()? {
                    Token::Tag(tag) if tag == "over" => true,
                    Token::Tag(tag) if tag == "under" => false,
                    other => return Err(ParseError::Unexpected(format!("{:?}", other))),
                };
                let limit = match self.next()? {
                    Token::Number(n) => n,
                    _ => return Err(ParseError::BadNumber),
                };
                Ok(Test::Size { over, limit })
            }
            "header" => {
                let match_type = self.match_tags()?.0;
                let headers = self.string_list()?;
                let keys = self.string_list()?;
                Ok(Test::Header {
                    match_type,
                    headers,
                    keys,
                })
            }
            "address" => {
                let (match_type, part) = self.match_tags()?;
                let headers = self.string_list()?;
                let keys = self.string_list()?;
                Ok(Test::Address {
                    part,
                    match_type,
                    headers,
                    keys,
                })
            }
            other => Err(ParseError::UnknownTest(other.to_string())),
        }
    }

    fn match_tags(&mut self) -> Result<(MatchType, AddressPart), ParseError> {
        let mut match_type = MatchType::Is;
        let mut part = AddressPart::All;
        while let Ok(Token::Tag(tag)) = self.peek() {
            let tag = tag.clone();
            self.advance();
            match tag.as_str() {
                "is" => match_type = MatchType::Is,
                "contains" => match_type = MatchType::Contains,
                "matches" => match_type = MatchType::Matches,
                "all" => part = AddressPart::All,
                "localpart" => part = AddressPart::LocalPart,
                "domain" => part = AddressPart::Domain,
                "comparator" => {
                    // accepted and ignored; we always use i;ascii-casemap
                    self.string()?;
                }
                other => return Err(ParseError::UnknownTag(other.to_string())),
            }
        }
        Ok((match_type, part))
    }

    fn test_list(&mut self) -> Result<Vec<Test>, ParseError> {
        self.expect(Token::ParenOpen)?;
        let mut tests = Vec::new();
        loop {
            tests.push(self.test()?);
            if tests.len() > MAX_LIST_LEN {
                return Err(ParseError::ListTooLong);
            }
            match self.next()? {
                Token::Comma => continue,
                Token::ParenClose => break,
                other => return Err(ParseError::Unexpected(format!("{:?}", other))),
            }
        }
        Ok(tests)
    }

    /// Either a single string or a bracketed list.
    fn string_list(&mut self) -> Result<Vec<String>, ParseError> {
        match self.next()? {
            Token::String(s) => Ok(vec![s]),
            Token::BracketOpen => {
                let mut items = Vec::new();
                loop {
                    match self.next()? {
                        Token::String(s) => {
                            items.push(s);
                            if items.len() > MAX_LIST_LEN {
                                return Err(ParseError::ListTooLong);
                            }
                        }
                        other => return Err(ParseError::Unexpected(format!("{:?}", other))),
                    }
                    match self.next()? {
                        Token::Comma => continue,
                        Token::BracketClose => break,
                        other => return Err(ParseError::Unexpected(format!("{:?}", other))),
                    }
                }
                Ok(items)
            }
            other => Err(ParseError::Unexpected(format!("{:?}", other))),
        }
    }

    fn string(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Token::String(s) => Ok(s),
            other => Err(ParseError::Unexpected(format!("{:?}", other))),
        }
    }

    fn identifier(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Token::Identifier(s) => Ok(s),
            other => Err(ParseError::Unexpected(format!("{:?}", other))),
        }
    }

    fn peek_identifier(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(Token::Identifier(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    // ---- token plumbing ----

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::TooDeep);
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Result<&Token, ParseError> {
        self.tokens.get(self.pos).ok_or(ParseError::UnexpectedEnd)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        let token = self.next()?;
        if token != expected {
            return Err(ParseError::Unexpected(format!("{:?}", token)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fileinto_rule() {
        let script = parse(
            "require [\"fileinto\"]; if header :contains \"Subject\" \"team\" { fileinto \"Team\"; }",
        )
        .unwrap();
        assert_eq!(script.requires, vec!["fileinto".to_string()]);
        match &script.commands[0] {
            Command::If { branches, .. } => {
                assert_eq!(branches.len(), 1);
                match &branches[0].0 {
                    Test::Header {
                        match_type,
                        headers,
                        keys,
                    } => {
                        assert_eq!(*match_type, MatchType::Contains);
                        assert_eq!(headers, &vec!["Subject".to_string()]);
                        assert_eq!(keys, &vec!["team".to_string()]);
                    }
                    other => panic!("unexpected test {:?}", other),
                }
                assert_eq!(branches[0].1, vec![Command::FileInto("Team".into())]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_elsif_else_chain() {
        let script = parse(
            "if size :over 1M { discard; } elsif exists \"X-Spam\" { fileinto \"Junk\"; } else { keep; }",
        )
        .unwrap();
        match &script.commands[0] {
            Command::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(otherwise.as_deref(), Some(&[Command::Keep][..]));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_vacation() {
        let script =
            parse("vacation :days 3 :subject \"Away\" \"I am away until Monday.\";").unwrap();
        assert_eq!(
            script.commands[0],
            Command::Vacation {
                days: Some(3),
                subject: Some("Away".into()),
                message: "I am away until Monday.".into(),
            }
        );
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut script = String::new();
        for _ in 0..=crate::MAX_DEPTH {
            script.push_str("if not ");
        }
        script.push_str("true { keep; }");
        assert_eq!(parse(&script), Err(ParseError::TooDeep));
    }

    #[test]
    fn serialize_roundtrip_is_stable() {
        let sources = [
            "require [\"fileinto\", \"vacation\"]; if header :contains \"Subject\" \"team\" { fileinto \"Team\"; stop; }",
            "if allof (exists \"List-Id\", size :under 4K) { discard; } else { keep; }",
            "if anyof (address :domain :is \"From\" \"example.com\", not true) { redirect \"x@y.z\"; }",
            "vacation :days 7 \"gone fishing\";",
        ];
        for src in sources {
            let first = parse(src).unwrap();
            let serialized = first.to_string();
            let second = parse(&serialized).unwrap();
            assert_eq!(first, second, "roundtrip diverged for {:?}", src);
        }
    }

    #[test]
    fn unknown_commands_fail() {
        assert!(matches!(
            parse("frobnicate \"x\";"),
            Err(ParseError::UnknownCommand(_))
        ));
    }
}
