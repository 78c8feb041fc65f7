//! `EFI_UNICODE_COLLATION_PROTOCOL` for English.

use crate::error::{Error, Result};
use crate::service::{Dispatcher, Registration, Request, Service};
use crate::trace::Trace;
use crate::uefi::guid::{UNICODE_COLLATION, UNICODE_COLLATION2};
use crate::uefi::table::collation as op;
use crate::uefi::EfiStatus;

pub const NAME: &str = "UnicodeCollation";

pub const REGISTRATION: Registration = Registration {
    name: NAME,
    guid: Some(UNICODE_COLLATION2),
    aliases: &[UNICODE_COLLATION],
    table_size: op::SIZE,
    create,
};

/// RFC 4646 for UnicodeCollation2; the ISO 639-2 "eng" form is not offered.
const LANGUAGES: &[u8] = b"en\0";
const LANGUAGES_OFFSET: u64 = 0x100;

const MAX_UNITS: usize = 0x1000;

fn create(_: &mut Dispatcher, trace: &mut dyn Trace, base: u64) -> Result<Box<dyn Service>> {
    trace.write(base + LANGUAGES_OFFSET, LANGUAGES)?;
    trace.write_word(base + op::SUPPORTED_LANGUAGES, base + LANGUAGES_OFFSET)?;
    Ok(Box::new(Collation))
}

/// FAT names longer than a UCS-2 string we would read are rejected.
fn check_fat_size(size: u64) -> Result<usize> {
    if size > MAX_UNITS as u64 {
        return Err(Error::invalid(format!("FAT name of {:#x} bytes", size)));
    }
    Ok(size as usize)
}

fn read_units(trace: &dyn Trace, addr: u64) -> Result<Vec<u16>> {
    if addr == 0 {
        return Err(Error::invalid("null string"));
    }
    let mut units = Vec::new();
    let mut b = [0u8; 2];
    for i in 0..MAX_UNITS as u64 {
        trace.read(addr + i * 2, &mut b)?;
        match u16::from_le_bytes(b) {
            0 => return Ok(units),
            u => units.push(u),
        }
    }
    Err(Error::invalid(format!("unterminated string at {:#x}", addr)))
}

fn write_units(trace: &mut dyn Trace, addr: u64, units: &[u16]) -> Result<()> {
    let bytes: Vec<u8> = units
        .iter()
        .chain(std::iter::once(&0))
        .flat_map(|u| u.to_le_bytes())
        .collect();
    trace.write(addr, &bytes)
}

fn map_case(u: u16, upper: bool) -> u16 {
    let Some(c) = char::from_u32(u32::from(u)) else {
        return u;
    };
    let mut mapped = if upper {
        c.to_uppercase().collect::<Vec<_>>()
    } else {
        c.to_lowercase().collect::<Vec<_>>()
    };
    match (mapped.pop(), mapped.is_empty()) {
        (Some(m), true) if (m as u32) <= 0xffff => m as u16,
        _ => u,
    }
}

fn lower(u: u16) -> u16 {
    map_case(u, false)
}

/// Case-insensitive ordering of two strings.
pub fn stri_coll(a: &[u16], b: &[u16]) -> std::cmp::Ordering {
    a.iter().map(|&u| lower(u)).cmp(b.iter().map(|&u| lower(u)))
}

const STAR: u16 = b'*' as u16;
const QUESTION: u16 = b'?' as u16;
const OPEN: u16 = b'[' as u16;
const CLOSE: u16 = b']' as u16;
const DASH: u16 = b'-' as u16;

/// Match `c` against the single pattern element at `pattern[at]`, which is
/// not a `*`. Returns the index of the next element on a hit.
fn match_element(pattern: &[u16], at: usize, c: u16) -> Option<usize> {
    let c = lower(c);
    match pattern[at] {
        QUESTION => Some(at + 1),
        OPEN => {
            let end = at + 1 + pattern[at + 1..].iter().position(|&u| u == CLOSE)?;
            let class = &pattern[at + 1..end];
            let mut i = 0;
            let mut hit = false;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == DASH {
                    hit |= (lower(class[i])..=lower(class[i + 2])).contains(&c);
                    i += 3;
                } else {
                    hit |= lower(class[i]) == c;
                    i += 1;
                }
            }
            hit.then_some(end + 1)
        }
        p => (lower(p) == c).then_some(at + 1),
    }
}

/// Case-insensitive match of `s` against a pattern with `*`, `?` and
/// `[...]` classes.
///
/// Only the most recent `*` is ever backtracked to, so the cost is
/// bounded by `s.len() * pattern.len()`.
pub fn metai_match(s: &[u16], pattern: &[u16]) -> bool {
    let (mut si, mut pi) = (0, 0);
    // Pattern index after the last `*`, and where in `s` it resumes.
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < pattern.len() && pattern[pi] == STAR {
            pi += 1;
            star = Some((pi, si));
            continue;
        }
        if pi < pattern.len() {
            if let Some(next) = match_element(pattern, pi, s[si]) {
                pi = next;
                si += 1;
                continue;
            }
        }
        match star {
            Some((after, from)) => {
                pi = after;
                si = from + 1;
                star = Some((after, from + 1));
            }
            None => return false,
        }
    }
    pattern[pi..].iter().all(|&u| u == STAR)
}

/// Convert to an upper-case 8.3 FAT name. Returns the bytes and whether
/// any character had to be replaced.
pub fn str_to_fat(s: &[u16], fat_size: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::with_capacity(fat_size.min(s.len()));
    let mut lossy = false;
    for &u in s {
        if out.len() == fat_size {
            break;
        }
        match u {
            0x2e | 0x20 => continue,
            0x21..=0x7e => out.push(map_case(u, true) as u8),
            _ => {
                out.push(b'_');
                lossy = true;
            }
        }
    }
    (out, lossy)
}

struct Collation;

impl Service for Collation {
    fn name(&self) -> &str {
        NAME
    }

    fn table_size(&self) -> u64 {
        op::SIZE
    }

    fn describe(&self, offset: u64) -> &'static str {
        match offset {
            op::STRI_COLL => "StriColl",
            op::METAI_MATCH => "MetaiMatch",
            op::STR_LWR => "StrLwr",
            op::STR_UPR => "StrUpr",
            op::FAT_TO_STR => "FatToStr",
            op::STR_TO_FAT => "StrToFat",
            op::SUPPORTED_LANGUAGES => "SupportedLanguages",
            _ => "?",
        }
    }

    fn call(&mut self, req: &mut Request<'_>) -> Result<EfiStatus> {
        match req.offset() {
            op::STRI_COLL => {
                let a = read_units(req.trace, req.arg(1)?)?;
                let b = read_units(req.trace, req.arg(2)?)?;
                // INTN: negative, zero or positive.
                req.return_value(stri_coll(&a, &b) as i64 as u64);
            }
            op::METAI_MATCH => {
                let s = read_units(req.trace, req.arg(1)?)?;
                let p = read_units(req.trace, req.arg(2)?)?;
                req.return_value(u64::from(metai_match(&s, &p)));
            }
            off @ (op::STR_LWR | op::STR_UPR) => {
                let addr = req.arg(1)?;
                let units: Vec<u16> = read_units(req.trace, addr)?
                    .into_iter()
                    .map(|u| map_case(u, off == op::STR_UPR))
                    .collect();
                write_units(req.trace, addr, &units)?;
            }
            op::FAT_TO_STR => {
                let (size, fat, out) = (req.arg(1)?, req.arg(2)?, req.arg(3)?);
                let size = check_fat_size(size)?;
                let mut units = Vec::new();
                let mut b = [0u8; 1];
                for i in 0..size as u64 {
                    req.trace.read(fat + i, &mut b)?;
                    if b[0] == 0 {
                        break;
                    }
                    units.push(u16::from(b[0]));
                }
                write_units(req.trace, out, &units)?;
            }
            op::STR_TO_FAT => {
                let s = read_units(req.trace, req.arg(1)?)?;
                let (size, fat) = (req.arg(2)?, req.arg(3)?);
                let size = check_fat_size(size)?;
                let (mut bytes, lossy) = str_to_fat(&s, size);
                if bytes.len() < size {
                    bytes.push(0);
                }
                req.trace.write(fat, &bytes)?;
                req.return_value(u64::from(lossy));
            }
            off => return Err(Error::unsupported(format!("collation slot {:#x}", off))),
        }
        Ok(EfiStatus::Success)
    }
}
