#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Social graph: follows/mutes, distances, overmute, binary codec.

pub mod codec;
pub mod engine;
pub mod ids;

pub use codec::{from_binary, to_binary, GraphCodecError, SerializeOptions};
pub use engine::{
    GraphEvent, SharedSocialGraph, SocialGraph, FOLLOW_LIST_KIND, MUTE_LIST_KIND,
    UNREACHABLE_DISTANCE,
};
pub use ids::{Uid, UniqueIds};
