//! Decoding of the engine's multiplexed stdout/stderr stream
//!
//! Without a TTY the engine prefixes each chunk with an 8-byte header:
//! one stream byte (0 stdin, 1 stdout, 2 stderr), three zero bytes and a
//! big-endian u32 payload length.

const HEADER_LEN: usize = 8;

/// Whether `data` starts with a plausible multiplex header
pub fn is_multiplexed(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data[0] <= 2 && data[1..4] == [0, 0, 0]
}

/// Strip multiplex headers, concatenating stdout and stderr payloads.
///
/// Input that does not look multiplexed is returned unchanged; a truncated
/// final frame keeps whatever payload arrived.
pub fn demultiplex(data: &[u8]) -> Vec<u8> {
    if !is_multiplexed(data) {
        return data.to_vec();
    }

    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    while rest.len() >= HEADER_LEN {
        if !is_multiplexed(rest) {
            out.extend_from_slice(rest);
            return out;
        }
        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (HEADER_LEN + size).min(rest.len());
        out.extend_from_slice(&rest[HEADER_LEN..end]);
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);
    out
}

/// Demultiplex and decode as UTF-8, replacing invalid sequences
pub fn demultiplex_lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(&demultiplex(data)).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_demultiplex_frames() {
        let mut data = frame(1, b"hello ");
        data.extend(frame(2, b"world\n"));
        assert_eq!(demultiplex_lossy(&data), "hello world\n");
    }

    #[test]
    fn test_raw_passthrough() {
        let raw = b"2024-05-01T10:00:00Z plain tty output\n";
        assert_eq!(demultiplex(raw), raw.to_vec());
        assert_eq!(demultiplex(b"abc"), b"abc".to_vec());
    }

    #[test]
    fn test_truncated_frame() {
        let mut data = frame(1, b"complete");
        let mut partial = frame(1, b"truncated payload");
        partial.truncate(HEADER_LEN + 5);
        data.extend(partial);
        assert_eq!(demultiplex_lossy(&data), "completetrunc");
    }
}
