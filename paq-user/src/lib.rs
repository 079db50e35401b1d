pub mod address;
pub mod config;
pub mod db;
pub mod directory;
pub mod login;
pub mod model;
pub mod password;

// A user is composed of three things:
// - an identity (a row in the `users` table, addressed as local@domain)
// - credentials (an Argon2id password hash)
// - a mail namespace (mailboxes + messages in the metadata index,
//   backed by a Maildir tree owned by paq-mail)
