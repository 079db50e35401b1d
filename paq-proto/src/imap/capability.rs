use imap_codec::imap_types::core::Vec1;
use imap_codec::imap_types::response::Capability;

#[derive(Debug, Clone)]
pub struct ServerCapability(Vec<Capability<'static>>);

impl ServerCapability {
    pub fn new(offer_starttls: bool) -> Self {
        let mut caps = vec![
            Capability::Imap4Rev1,
            Capability::Idle,
            Capability::LiteralPlus,
            Capability::try_from("AUTH=PLAIN").unwrap(),
        ];
        if offer_starttls {
            caps.push(Capability::try_from("STARTTLS").unwrap());
        }
        Self(caps)
    }

    pub fn to_vec(&self) -> Vec1<Capability<'static>> {
        self.0.clone().try_into().unwrap()
    }
}
