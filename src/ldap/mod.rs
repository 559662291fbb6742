/// LDAP front end for groupware clients
///
/// Speaks the small LDAPv3 subset needed to browse the address list and to
/// look up a group with its members: bind, search, unbind. Everything else
/// is refused.
pub mod ber;
pub mod listener;
pub mod message;
pub mod session;
pub mod tree;

pub use listener::LdapListener;
