use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display)]
#[display(fmt = "session-{}", _0)]
/// Identifies one accepted connection for as long as it is registered.
///
/// Session ids are handed out in increasing order, so ordering them gives the order in which
/// the connections were accepted.
pub struct SessionId(pub(crate) u64);

#[derive(Eq, PartialEq, Hash, Debug, Clone, Display, From, Into, Serialize, Deserialize)]
/// The identity a participant announces in its updates.
pub struct ClientIdentity(String);

impl From<&str> for ClientIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
