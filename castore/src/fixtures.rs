//! Shared fixtures for unit tests across the workspace.

use lazy_static::lazy_static;

use crate::ObjectId;

pub const HELLO_BLOB_CONTENTS: &[u8] = b"hello";
pub const WORLD_BLOB_CONTENTS: &[u8] = b"world";

lazy_static! {
    pub static ref DUMMY_ID: ObjectId = ObjectId::from_bytes(vec![0u8; 20]);
    pub static ref DUMMY_ID_2: ObjectId = {
        let mut bytes = vec![0u8; 20];
        bytes[0] = 0x10;
        ObjectId::from_bytes(bytes)
    };
    pub static ref HELLO_BLOB_ID: ObjectId =
        ObjectId::from_bytes(blake3::hash(HELLO_BLOB_CONTENTS).as_bytes().to_vec());
    pub static ref WORLD_BLOB_ID: ObjectId =
        ObjectId::from_bytes(blake3::hash(WORLD_BLOB_CONTENTS).as_bytes().to_vec());
}
