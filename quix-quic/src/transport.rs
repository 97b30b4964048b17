//! Transport parameters (draft-12 Section 6.4).
//!
//! Encoded as a list of `(u16 id, u16 len, value)` entries with
//! fixed-width values. The blob rides inside the TLS handshake; the
//! engine hands it over opaquely.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, QuicError, Result};

const PARAM_INITIAL_MAX_STREAM_DATA: u16 = 0x0000;
const PARAM_INITIAL_MAX_DATA: u16 = 0x0001;
const PARAM_INITIAL_MAX_STREAM_ID_BIDI: u16 = 0x0002;
const PARAM_IDLE_TIMEOUT: u16 = 0x0003;
const PARAM_MAX_PACKET_SIZE: u16 = 0x0005;
const PARAM_STATELESS_RESET_TOKEN: u16 = 0x0006;
const PARAM_ACK_DELAY_EXPONENT: u16 = 0x0007;
const PARAM_INITIAL_MAX_STREAM_ID_UNI: u16 = 0x0008;

/// Peer-advertised (or locally configured) limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub initial_max_stream_data: u32,
    pub initial_max_data: u32,
    pub initial_max_stream_id_bidi: u32,
    /// Seconds; zero disables the idle timer.
    pub idle_timeout: u16,
    pub max_packet_size: u16,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub ack_delay_exponent: u8,
    pub initial_max_stream_id_uni: u32,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_stream_data: 256 * 1024,
            initial_max_data: 1024 * 1024,
            initial_max_stream_id_bidi: 128,
            idle_timeout: 30,
            max_packet_size: crate::MAX_DATAGRAM_SIZE as u16,
            stateless_reset_token: None,
            ack_delay_exponent: 3,
            initial_max_stream_id_uni: 130,
        }
    }
}

impl TransportParameters {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        put_param(&mut buf, PARAM_INITIAL_MAX_STREAM_DATA, &self.initial_max_stream_data.to_be_bytes());
        put_param(&mut buf, PARAM_INITIAL_MAX_DATA, &self.initial_max_data.to_be_bytes());
        put_param(
            &mut buf,
            PARAM_INITIAL_MAX_STREAM_ID_BIDI,
            &self.initial_max_stream_id_bidi.to_be_bytes(),
        );
        put_param(&mut buf, PARAM_IDLE_TIMEOUT, &self.idle_timeout.to_be_bytes());
        put_param(&mut buf, PARAM_MAX_PACKET_SIZE, &self.max_packet_size.to_be_bytes());
        if let Some(token) = &self.stateless_reset_token {
            put_param(&mut buf, PARAM_STATELESS_RESET_TOKEN, token);
        }
        put_param(&mut buf, PARAM_ACK_DELAY_EXPONENT, &[self.ack_delay_exponent]);
        put_param(
            &mut buf,
            PARAM_INITIAL_MAX_STREAM_ID_UNI,
            &self.initial_max_stream_id_uni.to_be_bytes(),
        );
        buf.freeze()
    }

    /// Decode a parameter blob. Unknown ids are skipped; duplicates and
    /// malformed lengths are fatal.
    pub fn decode(mut blob: &[u8]) -> Result<Self> {
        let mut params = Self {
            initial_max_stream_data: 0,
            initial_max_data: 0,
            initial_max_stream_id_bidi: 0,
            idle_timeout: 0,
            max_packet_size: crate::MAX_DATAGRAM_SIZE as u16,
            stateless_reset_token: None,
            ack_delay_exponent: 3,
            initial_max_stream_id_uni: 0,
        };
        let mut seen = Vec::new();

        while blob.has_remaining() {
            if blob.remaining() < 4 {
                return Err(Error::Quic(QuicError::TransportParameterError));
            }
            let id = blob.get_u16();
            let len = blob.get_u16() as usize;
            if blob.remaining() < len {
                return Err(Error::Quic(QuicError::TransportParameterError));
            }
            if seen.contains(&id) {
                return Err(Error::Quic(QuicError::TransportParameterError));
            }
            seen.push(id);
            let value = &blob[..len];

            match id {
                PARAM_INITIAL_MAX_STREAM_DATA => {
                    params.initial_max_stream_data = get_u32(value)?;
                }
                PARAM_INITIAL_MAX_DATA => params.initial_max_data = get_u32(value)?,
                PARAM_INITIAL_MAX_STREAM_ID_BIDI => {
                    params.initial_max_stream_id_bidi = get_u32(value)?;
                }
                PARAM_IDLE_TIMEOUT => params.idle_timeout = get_u16(value)?,
                PARAM_MAX_PACKET_SIZE => {
                    let size = get_u16(value)?;
                    if size < 1200 {
                        return Err(Error::Quic(QuicError::TransportParameterError));
                    }
                    params.max_packet_size = size;
                }
                PARAM_STATELESS_RESET_TOKEN => {
                    if len != 16 {
                        return Err(Error::Quic(QuicError::TransportParameterError));
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(value);
                    params.stateless_reset_token = Some(token);
                }
                PARAM_ACK_DELAY_EXPONENT => {
                    if len != 1 || value[0] > 20 {
                        return Err(Error::Quic(QuicError::TransportParameterError));
                    }
                    params.ack_delay_exponent = value[0];
                }
                PARAM_INITIAL_MAX_STREAM_ID_UNI => {
                    params.initial_max_stream_id_uni = get_u32(value)?;
                }
                _ => {} // unknown parameters are ignored
            }
            blob.advance(len);
        }
        Ok(params)
    }
}

fn put_param(buf: &mut BytesMut, id: u16, value: &[u8]) {
    buf.put_u16(id);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn get_u32(value: &[u8]) -> Result<u32> {
    if value.len() != 4 {
        return Err(Error::Quic(QuicError::TransportParameterError));
    }
    Ok(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

fn get_u16(value: &[u8]) -> Result<u16> {
    if value.len() != 2 {
        return Err(Error::Quic(QuicError::TransportParameterError));
    }
    Ok(u16::from_be_bytes([value[0], value[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let params = TransportParameters {
            initial_max_stream_data: 65_536,
            initial_max_data: 1 << 20,
            initial_max_stream_id_bidi: 20,
            idle_timeout: 60,
            max_packet_size: 1350,
            stateless_reset_token: Some([0xAA; 16]),
            ack_delay_exponent: 5,
            initial_max_stream_id_uni: 22,
        };
        let blob = params.encode();
        assert_eq!(TransportParameters::decode(&blob).unwrap(), params);
    }

    #[test]
    fn test_default_roundtrip() {
        let params = TransportParameters::default();
        let decoded = TransportParameters::decode(&params.encode()).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_unknown_parameter_skipped() {
        let mut blob = BytesMut::new();
        put_param(&mut blob, 0x7F00, &[1, 2, 3]);
        put_param(&mut blob, PARAM_IDLE_TIMEOUT, &30u16.to_be_bytes());
        let params = TransportParameters::decode(&blob).unwrap();
        assert_eq!(params.idle_timeout, 30);
    }

    #[test]
    fn test_duplicate_parameter_fatal() {
        let mut blob = BytesMut::new();
        put_param(&mut blob, PARAM_IDLE_TIMEOUT, &30u16.to_be_bytes());
        put_param(&mut blob, PARAM_IDLE_TIMEOUT, &60u16.to_be_bytes());
        assert_eq!(
            TransportParameters::decode(&blob).unwrap_err(),
            Error::Quic(QuicError::TransportParameterError)
        );
    }

    #[test]
    fn test_malformed_length_fatal() {
        let mut blob = BytesMut::new();
        put_param(&mut blob, PARAM_INITIAL_MAX_DATA, &[0, 1]);
        assert!(TransportParameters::decode(&blob).is_err());

        let mut blob = BytesMut::new();
        blob.put_u16(PARAM_INITIAL_MAX_DATA);
        blob.put_u16(10);
        blob.put_u8(1); // truncated value
        assert!(TransportParameters::decode(&blob).is_err());
    }

    #[test]
    fn test_undersized_max_packet_size_fatal() {
        let mut blob = BytesMut::new();
        put_param(&mut blob, PARAM_MAX_PACKET_SIZE, &1199u16.to_be_bytes());
        assert!(TransportParameters::decode(&blob).is_err());
    }
}
