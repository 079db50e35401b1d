use anyhow::Result;
use imap_codec::imap_types::command::Command;
use imap_codec::imap_types::core::Tag;
use imap_codec::imap_types::response::{Code, Data, Status};

use crate::imap::ToOwnedTag;

#[derive(Debug)]
pub enum Body<'a> {
    Data(Data<'a>),
    Status(Status<'a>),
}

pub struct Response<'a> {
    pub body: Vec<Body<'a>>,
    pub completion: Status<'a>,
}

impl Response<'_> {
    pub fn build() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    pub fn bye() -> Result<Response<'static>> {
        Ok(Response {
            body: vec![],
            completion: Status::bye(None, "Logging out")
                .map_err(|e| anyhow::anyhow!("bye: {}", e))?,
        })
    }

    pub fn is_bye(&self) -> bool {
        matches!(self.completion, Status::Bye { .. })
    }
}

#[derive(Default)]
pub struct ResponseBuilder {
    tag: Option<Tag<'static>>,
    code: Option<Code<'static>>,
    text: String,
    body: Vec<Body<'static>>,
}

impl ResponseBuilder {
    pub fn to_req(mut self, cmd: &Command<'_>) -> Self {
        self.tag = Some(cmd.tag.to_owned_tag());
        self
    }

    pub fn tag(mut self, tag: Tag<'static>) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn message(mut self, txt: impl Into<String>) -> Self {
        self.text = txt.into();
        self
    }

    pub fn code(mut self, code: Code<'static>) -> Self {
        self.code = Some(code);
        self
    }

    pub fn data(mut self, data: Data<'static>) -> Self {
        self.body.push(Body::Data(data));
        self
    }

    pub fn many_data(mut self, data: Vec<Data<'static>>) -> Self {
        for d in data {
            self.body.push(Body::Data(d));
        }
        self
    }

    pub fn set_body(mut self, body: Vec<Body<'static>>) -> Self {
        self.body = body;
        self
    }

    pub fn ok(self) -> Result<Response<'static>> {
        let text = nonempty(self.text);
        Ok(Response {
            body: self.body,
            completion: Status::ok(self.tag, self.code, text)
                .map_err(|e| anyhow::anyhow!("ok status: {}", e))?,
        })
    }

    pub fn no(self) -> Result<Response<'static>> {
        let text = nonempty(self.text);
        Ok(Response {
            body: self.body,
            completion: Status::no(self.tag, self.code, text)
                .map_err(|e| anyhow::anyhow!("no status: {}", e))?,
        })
    }

    pub fn bad(self) -> Result<Response<'static>> {
        let text = nonempty(self.text);
        Ok(Response {
            body: self.body,
            completion: Status::bad(self.tag, self.code, text)
                .map_err(|e| anyhow::anyhow!("bad status: {}", e))?,
        })
    }
}

/// Status text must not be empty per the grammar.
fn nonempty(text: String) -> String {
    if text.is_empty() {
        "done".to_string()
    } else {
        text
    }
}
