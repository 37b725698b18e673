pub(crate) mod authority_client;
pub(crate) mod channel;
