use protobuf::Message as ProtobufMessage;
use raft::prelude::*;

use crate::error::{KronosError, Result};

// Byte codecs for the raft types we persist in redb. Entries, hard state and
// conf state use a fixed little-endian layout; full peer messages go through
// the raft-proto protobuf codec since they carry nested entries/snapshots.

pub fn serialize_entry(entry: &Entry) -> Result<Vec<u8>> {
    // Format: [index:8][term:8][entry_type:1][data_len:4][data][context_len:4][context][sync_log:1]
    let mut buf = Vec::with_capacity(26 + entry.data.len() + entry.context.len());
    buf.extend_from_slice(&entry.index.to_le_bytes());
    buf.extend_from_slice(&entry.term.to_le_bytes());
    buf.push(entry.entry_type as u8);
    buf.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.data);
    buf.extend_from_slice(&(entry.context.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.context);
    buf.push(u8::from(entry.sync_log));
    Ok(buf)
}

pub fn deserialize_entry(data: &[u8]) -> Result<Entry> {
    // Minimum size: 8+8+1+4+4+1
    if data.len() < 26 {
        return Err(codec_err("deserialize entry", "insufficient data"));
    }

    let mut cursor = 0;
    let index = u64::from_le_bytes(data[cursor..cursor + 8].try_into().unwrap());
    cursor += 8;
    let term = u64::from_le_bytes(data[cursor..cursor + 8].try_into().unwrap());
    cursor += 8;
    let entry_type = match data[cursor] {
        0 => EntryType::EntryNormal,
        1 => EntryType::EntryConfChange,
        2 => EntryType::EntryConfChangeV2,
        other => {
            return Err(codec_err(
                "deserialize entry",
                &format!("unknown entry type {}", other),
            ))
        }
    };
    cursor += 1;

    let data_len = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
    cursor += 4;
    if cursor + data_len + 5 > data.len() {
        return Err(codec_err("deserialize entry", "truncated entry data"));
    }
    let entry_data = data[cursor..cursor + data_len].to_vec();
    cursor += data_len;

    let context_len = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
    cursor += 4;
    if cursor + context_len + 1 > data.len() {
        return Err(codec_err("deserialize entry", "truncated entry context"));
    }
    let context = data[cursor..cursor + context_len].to_vec();
    cursor += context_len;

    let sync_log = data[cursor] != 0;

    let mut entry = Entry::default();
    entry.set_index(index);
    entry.set_term(term);
    entry.set_entry_type(entry_type);
    entry.set_data(entry_data.into());
    entry.set_context(context.into());
    entry.set_sync_log(sync_log);
    Ok(entry)
}

pub fn serialize_hard_state(hs: &HardState) -> Result<Vec<u8>> {
    // Format: [term:8][vote:8][commit:8]
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&hs.term.to_le_bytes());
    buf.extend_from_slice(&hs.vote.to_le_bytes());
    buf.extend_from_slice(&hs.commit.to_le_bytes());
    Ok(buf)
}

pub fn deserialize_hard_state(data: &[u8]) -> Result<HardState> {
    if data.len() != 24 {
        return Err(codec_err("deserialize hard state", "invalid data length"));
    }
    let mut hs = HardState::default();
    hs.set_term(u64::from_le_bytes(data[0..8].try_into().unwrap()));
    hs.set_vote(u64::from_le_bytes(data[8..16].try_into().unwrap()));
    hs.set_commit(u64::from_le_bytes(data[16..24].try_into().unwrap()));
    Ok(hs)
}

pub fn serialize_conf_state(cs: &ConfState) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for list in [
        &cs.voters,
        &cs.learners,
        &cs.voters_outgoing,
        &cs.learners_next,
    ] {
        buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
        for &id in list.iter() {
            buf.extend_from_slice(&id.to_le_bytes());
        }
    }
    buf.push(u8::from(cs.auto_leave));
    Ok(buf)
}

pub fn deserialize_conf_state(data: &[u8]) -> Result<ConfState> {
    let mut cs = ConfState::default();
    let mut cursor = 0;

    let mut read_list = |cursor: &mut usize| -> Result<Vec<u64>> {
        if *cursor + 4 > data.len() {
            return Err(codec_err("deserialize conf state", "truncated list length"));
        }
        let len = u32::from_le_bytes(data[*cursor..*cursor + 4].try_into().unwrap()) as usize;
        *cursor += 4;
        if *cursor + len * 8 > data.len() {
            return Err(codec_err("deserialize conf state", "truncated list"));
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(u64::from_le_bytes(
                data[*cursor..*cursor + 8].try_into().unwrap(),
            ));
            *cursor += 8;
        }
        Ok(out)
    };

    cs.set_voters(read_list(&mut cursor)?);
    cs.set_learners(read_list(&mut cursor)?);
    cs.set_voters_outgoing(read_list(&mut cursor)?);
    cs.set_learners_next(read_list(&mut cursor)?);
    if cursor < data.len() {
        cs.auto_leave = data[cursor] != 0;
    }
    Ok(cs)
}

/// Full wire encoding for peer messages; these carry nested entries and
/// snapshots, so they go through the raft protobuf codec.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    msg.write_to_bytes()
        .map_err(|e| KronosError::serialization("serialize raft message", e))
}

pub fn deserialize_message(data: &[u8]) -> Result<Message> {
    let mut msg = Message::default();
    msg.merge_from_bytes(data)
        .map_err(|e| KronosError::serialization("deserialize raft message", e))?;
    Ok(msg)
}

pub fn serialize_conf_change(cc: &ConfChange) -> Result<Vec<u8>> {
    cc.write_to_bytes()
        .map_err(|e| KronosError::serialization("serialize conf change", e))
}

pub fn deserialize_conf_change(data: &[u8]) -> Result<ConfChange> {
    let mut cc = ConfChange::default();
    cc.merge_from_bytes(data)
        .map_err(|e| KronosError::serialization("deserialize conf change", e))?;
    Ok(cc)
}

fn codec_err(operation: &str, message: &str) -> KronosError {
    KronosError::Serialization {
        operation: operation.to_string(),
        source: message.to_string().into(),
    }
}
