//! DNS message codec, just enough of RFC 1035 for an authoritative
//! single-name responder: questions, A and PTR answers, and
//! compression-pointer-tolerant name decoding.

use byteorder::{BigEndian, WriteBytesExt};

pub const QTYPE_A: u16 = 1;
pub const QTYPE_PTR: u16 = 12;
pub const QCLASS_IN: u16 = 1;

const MAX_POINTER_JUMPS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RrData {
    A(u32),
    Ptr(String),
    Other(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub typ: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RrData,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dns {
    pub id: u16,
    pub is_response: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Option<u8> {
    let v = *buf.get(*pos)?;
    *pos += 1;
    Some(v)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Option<u16> {
    let hi = read_u8(buf, pos)?;
    let lo = read_u8(buf, pos)?;
    Some(u16::from_be_bytes([hi, lo]))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let hi = read_u16(buf, pos)?;
    let lo = read_u16(buf, pos)?;
    Some(((hi as u32) << 16) | lo as u32)
}

/// Decode a possibly-compressed domain name starting at `*pos`. On return
/// `*pos` sits just past the name as it appeared in place (pointers are
/// followed for content but never advance the outer position past the
/// two pointer bytes).
fn parse_name(buf: &[u8], pos: &mut usize) -> Option<String> {
    let mut labels: Vec<String> = vec![];
    let mut cursor = *pos;
    let mut jumped = false;
    let mut jumps = 0;
    loop {
        let len = *buf.get(cursor)? as usize;
        if len & 0xc0 == 0xc0 {
            let lo = *buf.get(cursor + 1)? as usize;
            if !jumped {
                *pos = cursor + 2;
                jumped = true;
            }
            cursor = ((len & 0x3f) << 8) | lo;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            continue;
        }
        if len == 0 {
            cursor += 1;
            break;
        }
        let label = buf.get(cursor + 1..cursor + 1 + len)?;
        labels.push(std::str::from_utf8(label).ok()?.to_string());
        cursor += 1 + len;
    }
    if !jumped {
        *pos = cursor;
    }
    Some(labels.join("."))
}

/// Encode `name` as uncompressed labels.
fn write_name(name: &str, out: &mut Vec<u8>) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let len = label.len().min(63);
        out.push(len as u8);
        out.extend_from_slice(&label.as_bytes()[..len]);
    }
    out.push(0);
}

fn name_len(name: &str) -> usize {
    let mut out = vec![];
    write_name(name, &mut out);
    out.len()
}

fn parse_question(buf: &[u8], pos: &mut usize) -> Option<Question> {
    let name = parse_name(buf, pos)?;
    let qtype = read_u16(buf, pos)?;
    let qclass = read_u16(buf, pos)?;
    Some(Question {
        name,
        qtype,
        qclass,
    })
}

fn parse_rr(buf: &[u8], pos: &mut usize) -> Option<ResourceRecord> {
    let name = parse_name(buf, pos)?;
    let typ = read_u16(buf, pos)?;
    let class = read_u16(buf, pos)?;
    let ttl = read_u32(buf, pos)?;
    let rdlength = read_u16(buf, pos)? as usize;
    let rdata_start = *pos;
    let rdata = buf.get(rdata_start..rdata_start + rdlength)?;
    let data = match typ {
        QTYPE_A if rdlength == 4 => {
            RrData::A(u32::from_be_bytes([rdata[0], rdata[1], rdata[2], rdata[3]]))
        }
        QTYPE_PTR => {
            let mut ptr_pos = rdata_start;
            RrData::Ptr(parse_name(buf, &mut ptr_pos)?)
        }
        _ => RrData::Other(rdata.to_vec()),
    };
    *pos = rdata_start + rdlength;
    Some(ResourceRecord {
        name,
        typ,
        class,
        ttl,
        data,
    })
}

impl ResourceRecord {
    fn marshal(&self, out: &mut Vec<u8>) {
        write_name(&self.name, out);
        out.write_u16::<BigEndian>(self.typ).unwrap();
        out.write_u16::<BigEndian>(self.class).unwrap();
        out.write_u32::<BigEndian>(self.ttl).unwrap();
        match self.data {
            RrData::A(addr) => {
                out.write_u16::<BigEndian>(4).unwrap();
                out.extend_from_slice(&addr.to_be_bytes());
            }
            RrData::Ptr(ref name) => {
                out.write_u16::<BigEndian>(name_len(name) as u16).unwrap();
                write_name(name, out);
            }
            RrData::Other(ref raw) => {
                out.write_u16::<BigEndian>(raw.len() as u16).unwrap();
                out.extend_from_slice(raw);
            }
        }
    }
}

impl Dns {
    /// A query shell with everything zeroed; handy for building questions.
    pub fn query(id: u16, questions: Vec<Question>) -> Dns {
        Dns {
            id,
            is_response: false,
            opcode: 0,
            aa: false,
            tc: false,
            rd: true,
            ra: false,
            rcode: 0,
            questions,
            answers: vec![],
            authorities: vec![],
            additionals: vec![],
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Dns> {
        let mut pos = 0;
        let id = read_u16(buf, &mut pos)?;
        let flags = read_u16(buf, &mut pos)?;
        let qdcount = read_u16(buf, &mut pos)?;
        let ancount = read_u16(buf, &mut pos)?;
        let nscount = read_u16(buf, &mut pos)?;
        let arcount = read_u16(buf, &mut pos)?;
        let mut questions = vec![];
        for _ in 0..qdcount {
            questions.push(parse_question(buf, &mut pos)?);
        }
        let mut sections = [vec![], vec![], vec![]];
        for (section, count) in sections.iter_mut().zip([ancount, nscount, arcount]) {
            for _ in 0..count {
                section.push(parse_rr(buf, &mut pos)?);
            }
        }
        let [answers, authorities, additionals] = sections;
        Some(Dns {
            id,
            is_response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0xf) as u8,
            aa: flags & 0x0400 != 0,
            tc: flags & 0x0200 != 0,
            rd: flags & 0x0100 != 0,
            ra: flags & 0x0080 != 0,
            rcode: (flags & 0xf) as u8,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![];
        out.write_u16::<BigEndian>(self.id).unwrap();
        let mut flags: u16 = 0;
        if self.is_response {
            flags |= 0x8000;
        }
        flags |= ((self.opcode & 0xf) as u16) << 11;
        if self.aa {
            flags |= 0x0400;
        }
        if self.tc {
            flags |= 0x0200;
        }
        if self.rd {
            flags |= 0x0100;
        }
        if self.ra {
            flags |= 0x0080;
        }
        flags |= (self.rcode & 0xf) as u16;
        out.write_u16::<BigEndian>(flags).unwrap();
        out.write_u16::<BigEndian>(self.questions.len() as u16).unwrap();
        out.write_u16::<BigEndian>(self.answers.len() as u16).unwrap();
        out.write_u16::<BigEndian>(self.authorities.len() as u16).unwrap();
        out.write_u16::<BigEndian>(self.additionals.len() as u16).unwrap();
        for q in &self.questions {
            write_name(&q.name, &mut out);
            out.write_u16::<BigEndian>(q.qtype).unwrap();
            out.write_u16::<BigEndian>(q.qclass).unwrap();
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            rr.marshal(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a_query(name: &str) -> Dns {
        Dns::query(
            0x1234,
            vec![Question {
                name: name.to_string(),
                qtype: QTYPE_A,
                qclass: QCLASS_IN,
            }],
        )
    }

    #[test]
    fn query_roundtrip() {
        let query = a_query("service.psik.com");
        let parsed = Dns::parse(&query.marshal()).unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn response_flags_roundtrip() {
        let mut msg = a_query("service.psik.com");
        msg.is_response = true;
        msg.aa = true;
        msg.ra = true;
        msg.answers.push(ResourceRecord {
            name: "service.psik.com".to_string(),
            typ: QTYPE_A,
            class: QCLASS_IN,
            ttl: 0,
            data: RrData::A(0x0a00_0101),
        });
        let parsed = Dns::parse(&msg.marshal()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.answers[0].data, RrData::A(0x0a00_0101));
    }

    #[test]
    fn a_record_wire_format_is_four_octets() {
        let mut msg = a_query("service.psik.com");
        msg.answers.push(ResourceRecord {
            name: "service.psik.com".to_string(),
            typ: QTYPE_A,
            class: QCLASS_IN,
            ttl: 0,
            data: RrData::A(u32::from(std::net::Ipv4Addr::new(10, 0, 2, 3))),
        });
        let wire = msg.marshal();
        // rdata are the last four octets of the message
        assert_eq!(&wire[wire.len() - 6..wire.len() - 4], &[0, 4]);
        assert_eq!(&wire[wire.len() - 4..], &[10, 0, 2, 3]);
    }

    #[test]
    fn ptr_record_roundtrip() {
        let mut msg = Dns::query(
            7,
            vec![Question {
                name: "254.254.254.10.in-addr.arpa".to_string(),
                qtype: QTYPE_PTR,
                qclass: QCLASS_IN,
            }],
        );
        msg.is_response = true;
        msg.answers.push(ResourceRecord {
            name: "254.254.254.10.in-addr.arpa".to_string(),
            typ: QTYPE_PTR,
            class: QCLASS_IN,
            ttl: 0,
            data: RrData::Ptr("service.psik.com".to_string()),
        });
        let parsed = Dns::parse(&msg.marshal()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn compressed_names_are_followed() {
        // header + one question ("a.bc") + one answer whose name is a
        // pointer back to the question name at offset 12
        let mut buf = vec![];
        buf.extend_from_slice(&0x0001u16.to_be_bytes());
        buf.extend_from_slice(&0x8000u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&[1, b'a', 2, b'b', b'c', 0]);
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        buf.extend_from_slice(&[0xc0, 12]); // pointer to "a.bc"
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let parsed = Dns::parse(&buf).unwrap();
        assert_eq!(parsed.questions[0].name, "a.bc");
        assert_eq!(parsed.answers[0].name, "a.bc");
        assert_eq!(parsed.answers[0].data, RrData::A(0x0102_0304));
    }

    #[test]
    fn pointer_loops_are_rejected() {
        let mut buf = vec![];
        buf.extend_from_slice(&0x0001u16.to_be_bytes());
        buf.extend_from_slice(&0x0000u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        buf.extend_from_slice(&[0xc0, 12]); // points at itself
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        assert!(Dns::parse(&buf).is_none());
    }

    #[test]
    fn truncated_message_is_rejected() {
        let wire = a_query("service.psik.com").marshal();
        assert!(Dns::parse(&wire[..wire.len() - 3]).is_none());
    }
}
