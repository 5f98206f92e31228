//! The 12-byte ASCII command string in a message header.
//!
//! We never serialize a `Command` on its own (it's derived from the
//! `Message` variant being encoded), but we do need to parse it off the wire
//! before we know which variant to decode into.

use std::io;

use crate::serialization::{BitcoinDeserialize, SerializationError};

/// A message command, corresponding 1:1 with a [`super::message::Message`] variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Reject,
    GetAddr,
    Addr,
    GetBlocks,
    Inv,
    GetHeaders,
    Headers,
    GetData,
    Block,
    Tx,
    NotFound,
    MemPool,
    FilterLoad,
    FilterAdd,
    FilterClear,
    MerkleBlock,
    SendCmpct,
    FeeFilter,
    SendHeaders,
    Alert,
}

impl Command {
    /// The 12-byte, NUL-padded ASCII command string used on the wire.
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Command::Version => b"version\0\0\0\0\0",
            Command::Verack => b"verack\0\0\0\0\0\0",
            Command::Ping => b"ping\0\0\0\0\0\0\0\0",
            Command::Pong => b"pong\0\0\0\0\0\0\0\0",
            Command::Reject => b"reject\0\0\0\0\0\0",
            Command::GetAddr => b"getaddr\0\0\0\0\0",
            Command::Addr => b"addr\0\0\0\0\0\0\0\0",
            Command::GetBlocks => b"getblocks\0\0\0",
            Command::Inv => b"inv\0\0\0\0\0\0\0\0\0",
            Command::GetHeaders => b"getheaders\0\0",
            Command::Headers => b"headers\0\0\0\0\0",
            Command::GetData => b"getdata\0\0\0\0\0",
            Command::Block => b"block\0\0\0\0\0\0\0",
            Command::Tx => b"tx\0\0\0\0\0\0\0\0\0\0",
            Command::NotFound => b"notfound\0\0\0\0",
            Command::MemPool => b"mempool\0\0\0\0\0",
            Command::FilterLoad => b"filterload\0\0",
            Command::FilterAdd => b"filteradd\0\0\0",
            Command::FilterClear => b"filterclear\0",
            Command::MerkleBlock => b"merkleblock\0",
            Command::SendCmpct => b"sendcmpct\0\0\0",
            Command::FeeFilter => b"feefilter\0\0\0",
            Command::SendHeaders => b"sendheaders\0",
            Command::Alert => b"alert\0\0\0\0\0\0\0",
        }
    }
}

impl BitcoinDeserialize for Command {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        let raw = <[u8; 12]>::bitcoin_deserialize(reader)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(match &raw[..end] {
            b"version" => Command::Version,
            b"verack" => Command::Verack,
            b"ping" => Command::Ping,
            b"pong" => Command::Pong,
            b"reject" => Command::Reject,
            b"getaddr" => Command::GetAddr,
            b"addr" => Command::Addr,
            b"getblocks" => Command::GetBlocks,
            b"inv" => Command::Inv,
            b"getheaders" => Command::GetHeaders,
            b"headers" => Command::Headers,
            b"getdata" => Command::GetData,
            b"block" => Command::Block,
            b"tx" => Command::Tx,
            b"notfound" => Command::NotFound,
            b"mempool" => Command::MemPool,
            b"filterload" => Command::FilterLoad,
            b"filteradd" => Command::FilterAdd,
            b"filterclear" => Command::FilterClear,
            b"merkleblock" => Command::MerkleBlock,
            b"sendcmpct" => Command::SendCmpct,
            b"feefilter" => Command::FeeFilter,
            b"sendheaders" => Command::SendHeaders,
            b"alert" => Command::Alert,
            _ => return Err(SerializationError::Parse("unrecognized command string")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_string_fits_in_twelve_bytes() {
        for command in [
            Command::Version,
            Command::Verack,
            Command::Ping,
            Command::Pong,
            Command::Reject,
            Command::GetAddr,
            Command::Addr,
            Command::GetBlocks,
            Command::Inv,
            Command::GetHeaders,
            Command::Headers,
            Command::GetData,
            Command::Block,
            Command::Tx,
            Command::NotFound,
            Command::MemPool,
            Command::FilterLoad,
            Command::FilterAdd,
            Command::FilterClear,
            Command::MerkleBlock,
            Command::SendCmpct,
            Command::FeeFilter,
            Command::SendHeaders,
            Command::Alert,
        ] {
            assert_eq!(command.bytes().len(), 12);
        }
    }

    #[test]
    fn round_trips_through_wire_bytes() {
        let bytes = Command::GetHeaders.bytes();
        let parsed = Command::bitcoin_deserialize(bytes).unwrap();
        assert_eq!(parsed, Command::GetHeaders);
    }
}
