//! Typed per-packet row and TSV parsing.

use std::net::IpAddr;

use super::DissectorError;
use super::fields::FIELDS;
use crate::timestamp::epoch_str_to_seconds;

/// TCP flag bits, standard header positions.
pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;
pub const FLAG_URG: u8 = 0x20;

/// One TCP frame as reported by the dissector.
///
/// A stream is identified by capture file plus `stream_id`; records within a
/// stream arrive in `frame_number` order. Option fields keep the dissector's
/// absent-vs-zero distinction: a blank column parses to `None`, never `0`.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub stream_id: u32,
    pub frame_number: u64,
    /// Exact decimal-seconds string as emitted by the dissector; the sink
    /// converts this with integer math to keep sub-microsecond digits.
    pub time_raw: String,
    /// Parsed seconds, microsecond-grade, for ordering and overlap tests.
    pub timestamp: f64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
    pub tcp_len: u32,
    pub window: u16,
    pub opt_mss: Option<u16>,
    pub opt_wscale: Option<u8>,
    pub opt_sack_perm: bool,
    pub opt_tsval: Option<u32>,
    pub opt_tsecr: Option<u32>,
    pub ip_id: Option<u16>,
    pub ttl: Option<u8>,
    pub cap_len: u32,
    pub orig_len: u32,
    pub payload_hex: Option<String>,
}

impl PacketRecord {
    pub fn is_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    /// SYN without ACK: the client's opening segment.
    pub fn is_syn_only(&self) -> bool {
        self.is_syn() && !self.is_ack()
    }

    /// SYN with ACK: the server's handshake reply.
    pub fn is_syn_ack(&self) -> bool {
        self.is_syn() && self.is_ack()
    }

    pub fn has_payload(&self) -> bool {
        self.tcp_len > 0
    }

    /// True when the frame was truncated at capture time.
    pub fn is_truncated(&self) -> bool {
        self.cap_len < self.orig_len
    }

    /// Payload bytes decoded from the dissector hex column, if captured.
    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        let hex = self.payload_hex.as_deref()?;
        decode_hex(hex)
    }
}

/// Parses one tab-separated dissector row.
///
/// `line_number` is 1-based and only used for error reporting. Rows with
/// fewer columns than requested are padded with blanks: old dissector
/// builds drop trailing separators for all-blank suffixes.
pub fn parse_row(line_number: u64, line: &str) -> Result<PacketRecord, DissectorError> {
    let mut columns: Vec<&str> = line.split('\t').collect();
    if columns.len() > FIELDS.len() {
        return Err(protocol(
            line_number,
            format!("expected at most {} columns, got {}", FIELDS.len(), columns.len()),
        ));
    }
    columns.resize(FIELDS.len(), "");
    let row = Row {
        line: line_number,
        columns,
    };

    let time_raw = row.get(2).to_string();
    let timestamp = epoch_str_to_seconds(&time_raw)
        .ok_or_else(|| protocol(line_number, format!("bad frame.time_epoch `{time_raw}`")))?;

    let src_ip = row.ip_addr(4, 29, "ip.src/ipv6.src")?;
    let dst_ip = row.ip_addr(5, 30, "ip.dst/ipv6.dst")?;

    let mut flags = 0u8;
    if row.flag(8)? {
        flags |= FLAG_SYN;
    }
    if row.flag(9)? {
        flags |= FLAG_ACK;
    }
    if row.flag(10)? {
        flags |= FLAG_FIN;
    }
    if row.flag(11)? {
        flags |= FLAG_RST;
    }
    if row.flag(27)? {
        flags |= FLAG_PSH;
    }
    if row.flag(28)? {
        flags |= FLAG_URG;
    }

    let payload_hex = match row.get(26) {
        "" => None,
        hex => Some(hex.replace(':', "")),
    };

    Ok(PacketRecord {
        stream_id: row.req_int(0)?,
        frame_number: row.req_int(1)?,
        time_raw,
        timestamp,
        src_ip,
        dst_ip,
        src_port: row.req_int(6)?,
        dst_port: row.req_int(7)?,
        flags,
        seq: row.req_int(12)?,
        ack: row.req_int(13)?,
        tcp_len: row.req_int(14)?,
        window: row.req_int(15)?,
        opt_mss: row.opt_int(16)?,
        opt_wscale: row.opt_int(17)?,
        opt_sack_perm: row.flag(18)?,
        opt_tsval: row.opt_int(19)?,
        opt_tsecr: row.opt_int(20)?,
        ip_id: row.opt_u16_maybe_hex(21)?,
        ttl: match row.opt_int(22)? {
            Some(ttl) => Some(ttl),
            None => row.opt_int(23)?,
        },
        cap_len: row.req_int(24)?,
        orig_len: row.req_int(25)?,
        payload_hex,
    })
}

struct Row<'a> {
    line: u64,
    columns: Vec<&'a str>,
}

impl Row<'_> {
    fn get(&self, index: usize) -> &str {
        // Multi-value columns (tunneled frames) report the outermost value.
        let value = self.columns[index].trim();
        value.split(',').next().unwrap_or("")
    }

    fn req_int<T: std::str::FromStr>(&self, index: usize) -> Result<T, DissectorError> {
        let value = self.get(index);
        value.parse().map_err(|_| {
            protocol(
                self.line,
                format!("field {} `{value}` is not a valid integer", FIELDS[index]),
            )
        })
    }

    fn opt_int<T: std::str::FromStr>(&self, index: usize) -> Result<Option<T>, DissectorError> {
        match self.get(index) {
            "" => Ok(None),
            value => value.parse().map(Some).map_err(|_| {
                protocol(
                    self.line,
                    format!("field {} `{value}` is not a valid integer", FIELDS[index]),
                )
            }),
        }
    }

    /// IP-ID style column: blank, decimal, or `0x`-prefixed hex.
    fn opt_u16_maybe_hex(&self, index: usize) -> Result<Option<u16>, DissectorError> {
        let value = self.get(index);
        if value.is_empty() {
            return Ok(None);
        }
        let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => value.parse::<u32>().ok(),
        };
        match parsed.and_then(|v| u16::try_from(v).ok()) {
            Some(v) => Ok(Some(v)),
            None => Err(protocol(
                self.line,
                format!("field {} `{value}` is not a 16-bit id", FIELDS[index]),
            )),
        }
    }

    /// Boolean flag column: blank means false.
    fn flag(&self, index: usize) -> Result<bool, DissectorError> {
        match self.get(index) {
            "" | "0" | "False" | "false" => Ok(false),
            "1" | "True" | "true" => Ok(true),
            value => Err(protocol(
                self.line,
                format!("field {} `{value}` is not a boolean", FIELDS[index]),
            )),
        }
    }

    fn ip_addr(
        &self,
        v4_index: usize,
        v6_index: usize,
        what: &str,
    ) -> Result<IpAddr, DissectorError> {
        for index in [v4_index, v6_index] {
            let value = self.get(index);
            if value.is_empty() {
                continue;
            }
            return value
                .parse()
                .map_err(|_| protocol(self.line, format!("bad address `{value}` in {what}")));
        }
        Err(protocol(self.line, format!("missing {what}")))
    }
}

fn protocol(line: u64, message: String) -> DissectorError {
    DissectorError::Protocol { line, message }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{FLAG_ACK, FLAG_SYN, parse_row};
    use crate::dissector::DissectorError;
    use crate::dissector::fields::FIELDS;

    /// Builds a row with sensible defaults, then applies overrides by field
    /// name so tests stay readable.
    fn row(overrides: &[(&str, &str)]) -> String {
        let mut columns = vec![""; FIELDS.len()];
        let defaults = [
            ("tcp.stream", "0"),
            ("frame.number", "1"),
            ("frame.time_epoch", "1716301882.000000001"),
            ("ip.version", "4"),
            ("ip.src", "10.0.0.1"),
            ("ip.dst", "10.0.0.2"),
            ("tcp.srcport", "51000"),
            ("tcp.dstport", "443"),
            ("tcp.seq", "1000"),
            ("tcp.ack", "0"),
            ("tcp.len", "0"),
            ("tcp.window_size_value", "64240"),
            ("frame.cap_len", "74"),
            ("frame.len", "74"),
        ];
        for (name, value) in defaults.iter().chain(overrides) {
            let index = FIELDS.iter().position(|f| f == name).expect("known field");
            columns[index] = value;
        }
        columns.join("\t")
    }

    #[test]
    fn parses_a_syn_row() {
        let line = row(&[
            ("tcp.flags.syn", "1"),
            ("tcp.options.mss_val", "1460"),
            ("tcp.options.wscale.shift", "7"),
            ("tcp.options.sack_perm", "1"),
            ("ip.id", "0x3039"),
            ("ip.ttl", "64"),
        ]);
        let record = parse_row(1, &line).expect("parse");
        assert_eq!(record.flags, FLAG_SYN);
        assert!(record.is_syn_only());
        assert_eq!(record.opt_mss, Some(1460));
        assert_eq!(record.opt_wscale, Some(7));
        assert!(record.opt_sack_perm);
        assert_eq!(record.ip_id, Some(0x3039));
        assert_eq!(record.ttl, Some(64));
        assert_eq!(record.time_raw, "1716301882.000000001");
    }

    #[test]
    fn blank_option_fields_are_absent_not_zero() {
        let record = parse_row(1, &row(&[])).expect("parse");
        assert_eq!(record.opt_mss, None);
        assert_eq!(record.opt_tsval, None);
        assert_eq!(record.ip_id, None);
        assert_eq!(record.ttl, None);
        assert!(!record.opt_sack_perm);
    }

    #[test]
    fn zero_ip_id_is_distinct_from_absent() {
        let record = parse_row(1, &row(&[("ip.id", "0x0000")])).expect("parse");
        assert_eq!(record.ip_id, Some(0));
    }

    #[test]
    fn syn_ack_flags_combine() {
        let line = row(&[("tcp.flags.syn", "1"), ("tcp.flags.ack", "1")]);
        let record = parse_row(1, &line).expect("parse");
        assert_eq!(record.flags, FLAG_SYN | FLAG_ACK);
        assert!(record.is_syn_ack());
    }

    #[test]
    fn ipv6_addresses_come_from_extension_columns() {
        let line = row(&[
            ("ip.version", "6"),
            ("ip.src", ""),
            ("ip.dst", ""),
            ("ipv6.src", "2001:db8::1"),
            ("ipv6.dst", "2001:db8::2"),
            ("ipv6.hlim", "55"),
        ]);
        let record = parse_row(1, &line).expect("parse");
        assert!(record.src_ip.is_ipv6());
        assert_eq!(record.ttl, Some(55));
        assert_eq!(record.ip_id, None);
    }

    #[test]
    fn non_integer_where_integer_expected_is_a_protocol_error() {
        let line = row(&[("tcp.seq", "abc")]);
        let err = parse_row(7, &line).expect_err("must fail");
        match err {
            DissectorError::Protocol { line, message } => {
                assert_eq!(line, 7);
                assert!(message.contains("tcp.seq"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_rows_are_padded_with_blanks() {
        let full = row(&[]);
        let truncated: String = full
            .split('\t')
            .take(27)
            .collect::<Vec<_>>()
            .join("\t");
        let record = parse_row(1, &truncated).expect("parse");
        assert_eq!(record.stream_id, 0);
    }

    #[test]
    fn payload_hex_strips_separators() {
        let line = row(&[("tcp.len", "4"), ("data.data", "de:ad:be:ef")]);
        let record = parse_row(1, &line).expect("parse");
        assert_eq!(record.payload_bytes(), Some(vec![0xde, 0xad, 0xbe, 0xef]));
    }
}
