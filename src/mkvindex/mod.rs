//! Optional auxiliary: extracts a Matroska keyframe cue index by reading
//! only the head and tail of a media through the Reader (spec §4.6).
//! This is a leaf utility, independent of the pool/cache logic beyond its
//! use of batch-mode `read_range`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::errors::CoreError;
use crate::reader::VirtualReader;

const HEAD_READ_SIZE: u64 = 1024 * 1024;
const TAIL_READ_SIZE: u64 = 2 * 1024 * 1024;
const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

const SEGMENT_INFO_ID: u32 = 0x1549_A966;
const TIMECODE_SCALE_ID: u32 = 0x2A_D7B1;
const CUES_ID: u32 = 0x1C53_BB6B;
const CUE_POINT_ID: u32 = 0xBB;
const CUE_TIME_ID: u32 = 0xB3;
const CUE_TRACK_POSITIONS_ID: u32 = 0xB7;
const CUE_TRACK_ID: u32 = 0xF7;
const CUE_CLUSTER_POSITION_ID: u32 = 0xF1;

/// One keyframe: presentation timestamp in milliseconds, the track it
/// belongs to, and the byte offset of its Cluster relative to the start of
/// the Segment (the seek target — `time_ms` alone gives no byte offset to
/// fetch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CuePoint {
    pub time_ms: u64,
    pub track: u32,
    pub cluster_offset: u64,
}

/// Reads EBML variable-length integer at `offset`. Returns `(value,
/// bytes_consumed)`; `bytes_consumed == 0` means truncated/invalid input.
fn read_vint(data: &[u8], offset: usize) -> (u64, usize) {
    let Some(&first) = data.get(offset) else {
        return (0, 0);
    };

    let len = if first & 0x80 != 0 {
        1
    } else if first & 0x40 != 0 {
        2
    } else if first & 0x20 != 0 {
        3
    } else if first & 0x10 != 0 {
        4
    } else if first & 0x08 != 0 {
        5
    } else if first & 0x04 != 0 {
        6
    } else if first & 0x02 != 0 {
        7
    } else if first & 0x01 != 0 {
        8
    } else {
        return (0, 0);
    };

    if offset + len > data.len() {
        return (0, 0);
    }

    let mask = match len {
        1 => 0x7F,
        2 => 0x3F,
        3 => 0x1F,
        4 => 0x0F,
        5 => 0x07,
        6 => 0x03,
        7 => 0x01,
        _ => 0x00,
    };

    let mut value = (first & mask) as u64;
    for &b in &data[offset + 1..offset + len] {
        value = (value << 8) | b as u64;
    }
    (value, len)
}

/// Reads an EBML element ID at `offset`. Returns `(id, bytes_consumed)`.
fn read_element_id(data: &[u8], offset: usize) -> (u32, usize) {
    let Some(&first) = data.get(offset) else {
        return (0, 0);
    };

    let len = if first & 0x80 != 0 {
        1
    } else if first & 0x40 != 0 {
        2
    } else if first & 0x20 != 0 {
        3
    } else if first & 0x10 != 0 {
        4
    } else {
        return (0, 0);
    };

    if offset + len > data.len() {
        return (0, 0);
    }

    let mut value = first as u32;
    for &b in &data[offset + 1..offset + len] {
        value = (value << 8) | b as u32;
    }
    (value, len)
}

fn read_uint(data: &[u8], offset: usize, length: usize) -> u64 {
    if offset + length > data.len() {
        return 0;
    }
    data[offset..offset + length]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn find_signature(data: &[u8], signature: &[u8]) -> Option<usize> {
    data.windows(signature.len()).position(|w| w == signature)
}

/// Extracts `TimecodeScale` (nanoseconds per timestamp unit) from the
/// Segment Info element, falling back to the Matroska default.
fn extract_timecode_scale(data: &[u8]) -> u64 {
    let Some(info_offset) = find_signature(data, &[0x15, 0x49, 0xA9, 0x66]) else {
        debug!("Segment Info not found, using default timecode scale");
        return DEFAULT_TIMECODE_SCALE;
    };

    let mut offset = info_offset;
    let (elem_id, id_len) = read_element_id(data, offset);
    if elem_id != SEGMENT_INFO_ID {
        return DEFAULT_TIMECODE_SCALE;
    }
    offset += id_len;

    let (info_size, size_len) = read_vint(data, offset);
    offset += size_len;
    let info_end = (offset + info_size as usize).min(data.len());

    while offset < info_end {
        let (inner_id, inner_id_len) = read_element_id(data, offset);
        if inner_id_len == 0 {
            break;
        }
        offset += inner_id_len;

        let (inner_size, inner_size_len) = read_vint(data, offset);
        if inner_size_len == 0 {
            break;
        }
        offset += inner_size_len;

        if inner_id == TIMECODE_SCALE_ID {
            return read_uint(data, offset, inner_size as usize);
        }
        offset += inner_size as usize;
    }

    debug!("TimecodeScale not found in Segment Info, using default");
    DEFAULT_TIMECODE_SCALE
}

/// Parses a `Cues` element starting at `offset` and returns keyframes for
/// `video_track`, in file order.
fn parse_cues(data: &[u8], offset: usize, timecode_scale: u64, video_track: u32) -> Vec<CuePoint> {
    let mut keyframes = Vec::new();

    let (element_id, id_len) = read_element_id(data, offset);
    if element_id != CUES_ID {
        return keyframes;
    }
    let mut offset = offset + id_len;

    let (cues_size, size_len) = read_vint(data, offset);
    offset += size_len;
    let cues_end = (offset + cues_size as usize).min(data.len());

    while offset < cues_end {
        let (elem_id, id_len) = read_element_id(data, offset);
        if id_len == 0 {
            break;
        }
        offset += id_len;

        let (elem_size, size_len) = read_vint(data, offset);
        if size_len == 0 {
            break;
        }
        offset += size_len;

        if elem_id == CUE_POINT_ID {
            let cue_end = (offset + elem_size as usize).min(data.len());
            let mut cue_time: Option<u64> = None;
            let mut cue_track: Option<u32> = None;
            let mut cue_cluster_position: Option<u64> = None;
            let mut cursor = offset;

            while cursor < cue_end {
                let (inner_id, inner_id_len) = read_element_id(data, cursor);
                if inner_id_len == 0 {
                    break;
                }
                cursor += inner_id_len;

                let (inner_size, inner_size_len) = read_vint(data, cursor);
                if inner_size_len == 0 {
                    break;
                }
                cursor += inner_size_len;

                if inner_id == CUE_TIME_ID {
                    cue_time = Some(read_uint(data, cursor, inner_size as usize));
                } else if inner_id == CUE_TRACK_POSITIONS_ID {
                    let track_end = (cursor + inner_size as usize).min(data.len());
                    let mut track_offset = cursor;
                    while track_offset < track_end {
                        let (track_id, track_id_len) = read_element_id(data, track_offset);
                        if track_id_len == 0 {
                            break;
                        }
                        track_offset += track_id_len;
                        let (track_size, track_size_len) = read_vint(data, track_offset);
                        if track_size_len == 0 {
                            break;
                        }
                        track_offset += track_size_len;
                        if track_id == CUE_TRACK_ID {
                            cue_track = Some(read_uint(data, track_offset, track_size as usize) as u32);
                        } else if track_id == CUE_CLUSTER_POSITION_ID {
                            cue_cluster_position = Some(read_uint(data, track_offset, track_size as usize));
                        }
                        track_offset += track_size as usize;
                    }
                }

                cursor += inner_size as usize;
            }

            if let (Some(time), Some(track), Some(cluster_offset)) = (cue_time, cue_track, cue_cluster_position) {
                if track == video_track {
                    let time_ms = time * timecode_scale / 1_000_000;
                    keyframes.push(CuePoint { time_ms, track, cluster_offset });
                }
            }

            offset = cue_end;
        } else {
            offset += elem_size as usize;
        }
    }

    keyframes
}

/// Reads the head and tail of `reader` through batch-mode `read_range` and
/// extracts the video-track keyframe index, if present.
pub async fn extract_cue_index(
    reader: &Arc<VirtualReader>,
    video_track: u32,
    cancel: &CancellationToken,
) -> Result<Vec<CuePoint>, CoreError> {
    let guard = reader.batch_mode();

    let head_len = HEAD_READ_SIZE.min(reader.total_size);
    let mut head = Vec::with_capacity(head_len as usize);
    reader.read_range(0, head_len, cancel, |b| head.extend_from_slice(&b)).await?;

    let tail_len = TAIL_READ_SIZE.min(reader.total_size);
    let tail_start = reader.total_size.saturating_sub(tail_len);
    let mut tail = Vec::with_capacity(tail_len as usize);
    reader
        .read_range(tail_start, reader.total_size, cancel, |b| tail.extend_from_slice(&b))
        .await?;

    drop(guard);

    let timecode_scale = extract_timecode_scale(&head);

    let Some(cues_offset) = find_signature(&tail, &[0x1C, 0x53, 0xBB, 0x6B]) else {
        warn!("Cues element not found in tail read");
        return Ok(Vec::new());
    };

    let keyframes = parse_cues(&tail, cues_offset, timecode_scale, video_track);
    info!(count = keyframes.len(), "extracted keyframe cue index");
    Ok(keyframes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_vint(out: &mut Vec<u8>, value: u64) {
        out.push(0x80 | (value as u8 & 0x7F));
    }

    fn write_element(out: &mut Vec<u8>, id: &[u8], body: &[u8]) {
        out.extend_from_slice(id);
        write_vint(out, body.len() as u64);
        out.extend_from_slice(body);
    }

    #[test]
    fn parses_single_cue_point_for_video_track() {
        let mut cue_time = Vec::new();
        write_element(&mut cue_time, &[0xB3], &[5]); // CueTime = 5

        let mut track_pos = Vec::new();
        write_element(&mut track_pos, &[0xF7], &[1]); // CueTrack = 1
        write_element(&mut track_pos, &[0xF1], &[0x01, 0x02, 0x03]); // CueClusterPosition = 0x010203

        let mut cue_track_positions = Vec::new();
        write_element(&mut cue_track_positions, &[0xB7], &track_pos);

        let mut cue_point_body = Vec::new();
        cue_point_body.extend_from_slice(&cue_time);
        cue_point_body.extend_from_slice(&cue_track_positions);

        let mut cue_point = Vec::new();
        write_element(&mut cue_point, &[0xBB], &cue_point_body);

        let mut cues_body = Vec::new();
        cues_body.extend_from_slice(&cue_point);

        let mut data = Vec::new();
        write_element(&mut data, &[0x1C, 0x53, 0xBB, 0x6B], &cues_body);

        let keyframes = parse_cues(&data, 0, 1_000_000, 1);
        assert_eq!(keyframes.len(), 1);
        assert_eq!(keyframes[0].time_ms, 5);
        assert_eq!(keyframes[0].track, 1);
        assert_eq!(keyframes[0].cluster_offset, 0x010203);
    }

    #[test]
    fn skips_cue_points_for_other_tracks() {
        let mut cue_time = Vec::new();
        write_element(&mut cue_time, &[0xB3], &[7]);

        let mut track_pos = Vec::new();
        write_element(&mut track_pos, &[0xF7], &[2]); // audio track
        write_element(&mut track_pos, &[0xF1], &[0x10]);

        let mut cue_track_positions = Vec::new();
        write_element(&mut cue_track_positions, &[0xB7], &track_pos);

        let mut cue_point_body = Vec::new();
        cue_point_body.extend_from_slice(&cue_time);
        cue_point_body.extend_from_slice(&cue_track_positions);

        let mut cue_point = Vec::new();
        write_element(&mut cue_point, &[0xBB], &cue_point_body);

        let mut data = Vec::new();
        write_element(&mut data, &[0x1C, 0x53, 0xBB, 0x6B], &cue_point);

        let keyframes = parse_cues(&data, 0, 1_000_000, 1);
        assert!(keyframes.is_empty());
    }

    #[test]
    fn cue_point_without_cluster_position_is_dropped() {
        let mut cue_time = Vec::new();
        write_element(&mut cue_time, &[0xB3], &[9]);

        let mut track_pos = Vec::new();
        write_element(&mut track_pos, &[0xF7], &[1]); // CueTrack = 1, no CueClusterPosition

        let mut cue_track_positions = Vec::new();
        write_element(&mut cue_track_positions, &[0xB7], &track_pos);

        let mut cue_point_body = Vec::new();
        cue_point_body.extend_from_slice(&cue_time);
        cue_point_body.extend_from_slice(&cue_track_positions);

        let mut cue_point = Vec::new();
        write_element(&mut cue_point, &[0xBB], &cue_point_body);

        let mut data = Vec::new();
        write_element(&mut data, &[0x1C, 0x53, 0xBB, 0x6B], &cue_point);

        let keyframes = parse_cues(&data, 0, 1_000_000, 1);
        assert!(keyframes.is_empty());
    }

    #[test]
    fn vint_and_element_id_roundtrip_one_byte() {
        let data = [0x81u8];
        assert_eq!(read_vint(&data, 0), (1, 1));
        assert_eq!(read_element_id(&data, 0), (0x81, 1));
    }
}
