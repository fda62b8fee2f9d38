//! Inventory wire codec.
//!
//! The module list is written twice. The legacy section (host version, legacy records,
//! freeform string, protocol version) is all an older peer reads. The extended section
//! follows: each record is tagged with its layout revision and prefixed with its body
//! length, so fields appended by later layouts can be skipped. Peers that write the
//! extended records without a length are read too; an unreadable extended section only
//! costs the layout revisions.

use std::collections::HashMap;

use crate::descriptor::{EnforcementLevel, ModuleDescriptor, ModuleVersion, VersionStrictness};
use crate::inventory::{HostInfo, ModuleInventory};
use crate::package::{Package, PackageError, MAX_STRING_LEN};

/// Sanity bound on the module count fields, enforced on both encode and decode.
pub const MAX_MODULES: usize = 4096;

/// The inventory exceeds what a decoder accepts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{0} modules exceed the limit of {max}", max = MAX_MODULES)]
    TooManyModules(usize),
    #[error("string of {0} bytes exceeds the limit of {max}", max = MAX_STRING_LEN)]
    StringTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error("invalid module count {0}")]
    BadCount(i32),
    #[error("invalid record length {0}")]
    BadRecordLength(i32),
    #[error("unknown enforcement level {0}")]
    UnknownEnforcement(i32),
    #[error("unknown version strictness {0}")]
    UnknownStrictness(i32),
}

/// Serialize an inventory into a fresh package. Refuses inventories [`decode`] would
/// reject, so every encoded message reads back.
pub fn encode(inventory: &ModuleInventory) -> Result<Package, EncodeError> {
    let modules = inventory.modules();
    if modules.len() > MAX_MODULES {
        return Err(EncodeError::TooManyModules(modules.len()));
    }
    let strings = modules
        .iter()
        .flat_map(|m| [m.id(), m.name()])
        .chain(std::iter::once(inventory.freeform_version()));
    if let Some(long) = strings.map(str::len).find(|&len| len > MAX_STRING_LEN) {
        return Err(EncodeError::StringTooLong(long));
    }

    let mut pkg = Package::new();
    write_version(&mut pkg, inventory.host_version());

    pkg.write_i32(inventory.modules().len() as i32);
    for m in inventory.modules() {
        write_record_body(&mut pkg, m);
    }

    pkg.write_str(inventory.freeform_version());
    pkg.write_u32(inventory.network_protocol_version());

    pkg.write_i32(inventory.modules().len() as i32);
    for m in inventory.modules() {
        pkg.write_i32(m.layout_version());
        let len_at = pkg.len();
        pkg.write_i32(0);
        let body_start = pkg.len();
        write_record_body(&mut pkg, m);
        let body_len = (pkg.len() - body_start) as i32;
        // len_at was written just above, so it is in range.
        let _ = pkg.patch_i32(len_at, body_len);
    }
    Ok(pkg)
}

/// Decode a received package. Failures are logged and yield `None`: a peer whose data
/// cannot be read is treated as having sent nothing.
pub fn decode(pkg: &mut Package) -> Option<ModuleInventory> {
    match try_decode(pkg) {
        Ok(inv) => Some(inv),
        Err(e) => {
            tracing::warn!(error = %e, len = pkg.len(), "failed to decode module inventory");
            None
        }
    }
}

/// Like [`decode`], returning the reason on failure.
pub fn try_decode(pkg: &mut Package) -> Result<ModuleInventory, DecodeError> {
    pkg.set_position(0)?;

    let version = read_version(pkg)?;
    let count = read_count(pkg)?;
    let mut modules = Vec::with_capacity(count);
    for _ in 0..count {
        modules.push(read_record_body(pkg, 0)?);
    }

    let mut host = HostInfo {
        version,
        ..HostInfo::default()
    };
    if pkg.remaining() > 0 {
        host.freeform_version = pkg.read_string()?;
    }
    if pkg.remaining() > 0 {
        host.network_protocol_version = pkg.read_u32()?;
    }

    if pkg.remaining() > 0 {
        if let Some(layouts) = read_extended_lenient(pkg) {
            modules = modules
                .into_iter()
                .map(|m| match layouts.get(m.id()) {
                    Some(&layout) => m.with_layout_version(layout),
                    None => m,
                })
                .collect();
        }
    }

    Ok(ModuleInventory::new(host, modules))
}

/// The extended section only contributes layout revisions, so it never fails the decode.
/// Records are read length-prefixed first, then without the length (layout tag followed
/// directly by the body). If neither parses the legacy descriptors stay at layout 0.
fn read_extended_lenient(pkg: &mut Package) -> Option<HashMap<String, i32>> {
    let start = pkg.position();
    let first = match read_extended(pkg, true) {
        Ok(layouts) => return Some(layouts),
        Err(e) => e,
    };
    pkg.set_position(start).ok()?;
    match read_extended(pkg, false) {
        Ok(layouts) => Some(layouts),
        Err(e) => {
            tracing::debug!(
                framed = %first,
                unframed = %e,
                "ignoring unreadable extended module section"
            );
            None
        }
    }
}

/// Layout revision per module id from the extended section.
fn read_extended(
    pkg: &mut Package,
    length_prefixed: bool,
) -> Result<HashMap<String, i32>, DecodeError> {
    let count = read_count(pkg)?;
    let mut layouts = HashMap::with_capacity(count);
    for _ in 0..count {
        let layout = pkg.read_i32()?;
        if !length_prefixed {
            let record = read_record_body(pkg, layout)?;
            layouts.insert(record.id().to_string(), layout);
            continue;
        }
        let len = pkg.read_i32()?;
        if len < 0 || len as usize > pkg.remaining() {
            return Err(DecodeError::BadRecordLength(len));
        }
        let end = pkg.position() + len as usize;
        let record = read_record_body(pkg, layout)?;
        if pkg.position() > end {
            return Err(DecodeError::BadRecordLength(len));
        }
        pkg.set_position(end)?;
        layouts.insert(record.id().to_string(), layout);
    }
    Ok(layouts)
}

fn write_version(pkg: &mut Package, v: ModuleVersion) {
    pkg.write_i32(v.major);
    pkg.write_i32(v.minor);
    pkg.write_i32(v.patch_or_sentinel());
}

fn read_version(pkg: &mut Package) -> Result<ModuleVersion, DecodeError> {
    let major = pkg.read_i32()?;
    let minor = pkg.read_i32()?;
    let patch = pkg.read_i32()?;
    Ok(ModuleVersion::from_wire(major, minor, patch))
}

fn read_count(pkg: &mut Package) -> Result<usize, DecodeError> {
    let n = pkg.read_i32()?;
    if n < 0 || n as usize > MAX_MODULES {
        return Err(DecodeError::BadCount(n));
    }
    Ok(n as usize)
}

fn write_record_body(pkg: &mut Package, m: &ModuleDescriptor) {
    pkg.write_str(m.id());
    pkg.write_str(m.name());
    write_version(pkg, m.version());
    pkg.write_i32(m.enforcement().to_wire());
    pkg.write_i32(m.strictness().to_wire());
}

fn read_record_body(pkg: &mut Package, layout: i32) -> Result<ModuleDescriptor, DecodeError> {
    let id = pkg.read_string()?;
    let name = pkg.read_string()?;
    let version = read_version(pkg)?;
    let enforcement = EnforcementLevel::from_wire(pkg.read_i32()?)?;
    let strictness = VersionStrictness::from_wire(pkg.read_i32()?)?;
    Ok(ModuleDescriptor::from_record(
        id,
        name,
        version,
        enforcement,
        strictness,
        layout,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LAYOUT_VERSION;
    use proptest::prelude::*;

    fn sample() -> ModuleInventory {
        ModuleInventory::new(
            HostInfo {
                version: ModuleVersion::new(0, 217, 46),
                network_protocol_version: 33,
                freeform_version: "0.217.46-ptb".to_string(),
            },
            vec![
                ModuleDescriptor::new(
                    "com.example.core",
                    "Core",
                    ModuleVersion::new(1, 2, 0),
                    EnforcementLevel::ServerMustHave,
                    VersionStrictness::Minor,
                ),
                ModuleDescriptor::new(
                    "com.example.maps",
                    "Maps",
                    ModuleVersion::without_patch(3, 1),
                    EnforcementLevel::VersionCheckOnly,
                    VersionStrictness::Patch,
                ),
            ],
        )
    }

    /// Bytes an implementation without the extended section would send.
    fn legacy_bytes(inv: &ModuleInventory, with_trailer: bool) -> Package {
        let mut pkg = Package::new();
        write_version(&mut pkg, inv.host_version());
        pkg.write_i32(inv.modules().len() as i32);
        for m in inv.modules() {
            write_record_body(&mut pkg, m);
        }
        if with_trailer {
            pkg.write_str(inv.freeform_version());
            pkg.write_u32(inv.network_protocol_version());
        }
        pkg
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let inv = sample();
        let mut pkg = encode(&inv).unwrap();
        let decoded = decode(&mut pkg).unwrap();
        assert_eq!(decoded, inv);
        assert!(decoded.modules().iter().all(|m| m.layout_version() == LAYOUT_VERSION));
    }

    #[test]
    fn empty_inventory_roundtrip() {
        let inv = ModuleInventory::default();
        let mut pkg = encode(&inv).unwrap();
        assert_eq!(decode(&mut pkg).unwrap(), inv);
    }

    #[test]
    fn decode_resets_cursor() {
        let mut pkg = encode(&sample()).unwrap();
        pkg.set_position(pkg.len()).unwrap();
        assert!(decode(&mut pkg).is_some());
    }

    #[test]
    fn peer_without_trailer_fields() {
        let inv = sample();
        let mut pkg = legacy_bytes(&inv, false);
        let decoded = decode(&mut pkg).unwrap();
        assert_eq!(decoded.freeform_version(), "");
        assert_eq!(decoded.network_protocol_version(), 0);
        assert_eq!(decoded.modules().len(), 2);
        assert!(decoded.modules().iter().all(|m| m.layout_version() == 0));
    }

    #[test]
    fn peer_without_extended_section() {
        let inv = sample();
        let mut pkg = legacy_bytes(&inv, true);
        let decoded = decode(&mut pkg).unwrap();
        assert_eq!(decoded.freeform_version(), "0.217.46-ptb");
        assert_eq!(decoded.network_protocol_version(), 33);
        assert_eq!(decoded.layout_version(), Some(0));
    }

    #[test]
    fn newer_layout_fields_are_skipped() {
        let inv = sample();
        let mut pkg = legacy_bytes(&inv, true);
        pkg.write_i32(inv.modules().len() as i32);
        for m in inv.modules() {
            pkg.write_i32(LAYOUT_VERSION + 1);
            let mut body = Package::new();
            write_record_body(&mut body, m);
            body.write_str("field from the future");
            body.write_i32(42);
            pkg.write_i32(body.len() as i32);
            pkg.write_bytes(body.as_bytes());
        }
        let decoded = decode(&mut pkg).unwrap();
        assert_eq!(decoded.modules().len(), 2);
        assert_eq!(decoded.layout_version(), Some(LAYOUT_VERSION + 1));
        assert!(!decoded.is_supported_layout());
    }

    #[test]
    fn extended_records_without_length_are_read() {
        let inv = sample();
        let mut pkg = legacy_bytes(&inv, true);
        pkg.write_i32(inv.modules().len() as i32);
        for m in inv.modules() {
            pkg.write_i32(LAYOUT_VERSION);
            write_record_body(&mut pkg, m);
        }
        let decoded = try_decode(&mut pkg).unwrap();
        assert_eq!(decoded.host(), inv.host());
        assert_eq!(decoded.modules().len(), 2);
        assert_eq!(decoded.find("com.example.core").unwrap().name(), "Core");
        assert_eq!(decoded.layout_version(), Some(LAYOUT_VERSION));
    }

    #[test]
    fn unreadable_extended_section_keeps_legacy_data() {
        let inv = sample();
        let mut pkg = legacy_bytes(&inv, true);
        pkg.write_i32(2);
        pkg.write_bytes(&[0xff, 0xff, 0xff]);
        let decoded = decode(&mut pkg).unwrap();
        assert_eq!(decoded.network_protocol_version(), 33);
        assert_eq!(decoded.modules().len(), 2);
        assert_eq!(decoded.layout_version(), Some(0));
    }

    #[test]
    fn encode_refuses_what_decode_rejects() {
        let many = ModuleInventory::new(
            HostInfo::default(),
            (0..=MAX_MODULES)
                .map(|i| {
                    ModuleDescriptor::new(
                        format!("m{i}"),
                        "m",
                        ModuleVersion::new(1, 0, 0),
                        EnforcementLevel::NotEnforced,
                        VersionStrictness::None,
                    )
                })
                .collect(),
        );
        assert_eq!(
            encode(&many),
            Err(EncodeError::TooManyModules(MAX_MODULES + 1))
        );

        let long_name = "n".repeat(MAX_STRING_LEN + 1);
        let wide = ModuleInventory::new(
            HostInfo::default(),
            vec![ModuleDescriptor::new(
                "wide",
                long_name,
                ModuleVersion::new(1, 0, 0),
                EnforcementLevel::NotEnforced,
                VersionStrictness::None,
            )],
        );
        assert_eq!(
            encode(&wide),
            Err(EncodeError::StringTooLong(MAX_STRING_LEN + 1))
        );
    }

    #[test]
    fn legacy_enforcement_alias_normalizes() {
        let mut pkg = Package::new();
        write_version(&mut pkg, ModuleVersion::new(1, 0, 0));
        pkg.write_i32(1);
        pkg.write_str("old");
        pkg.write_str("Old");
        write_version(&mut pkg, ModuleVersion::new(1, 0, 0));
        pkg.write_i32(5);
        pkg.write_i32(1);
        let decoded = decode(&mut pkg).unwrap();
        assert_eq!(
            decoded.find("old").unwrap().enforcement(),
            EnforcementLevel::VersionCheckOnly
        );
    }

    #[test]
    fn truncated_legacy_section_fails() {
        let full = encode(&sample()).unwrap().into_bytes();
        let mut pkg = Package::from_bytes(full[..20].to_vec());
        assert!(decode(&mut pkg).is_none());
        let mut empty = Package::new();
        assert!(decode(&mut empty).is_none());
    }

    #[test]
    fn negative_count_fails() {
        let mut pkg = Package::new();
        write_version(&mut pkg, ModuleVersion::new(1, 0, 0));
        pkg.write_i32(-3);
        assert_eq!(try_decode(&mut pkg), Err(DecodeError::BadCount(-3)));
    }

    #[test]
    fn unknown_enum_fails_whole_decode() {
        let mut pkg = Package::new();
        write_version(&mut pkg, ModuleVersion::new(1, 0, 0));
        pkg.write_i32(1);
        pkg.write_str("x");
        pkg.write_str("X");
        write_version(&mut pkg, ModuleVersion::new(1, 0, 0));
        pkg.write_i32(1);
        pkg.write_i32(9);
        assert_eq!(try_decode(&mut pkg), Err(DecodeError::UnknownStrictness(9)));
    }

    fn arb_descriptor() -> impl Strategy<Value = ModuleDescriptor> {
        (
            "[a-z.]{1,16}",
            "[A-Za-z ]{0,16}",
            0..100i32,
            0..100i32,
            prop::option::of(0..100i32),
            0..5i32,
            0..4i32,
        )
            .prop_map(|(id, name, major, minor, patch, level, strict)| {
                ModuleDescriptor::new(
                    id,
                    name,
                    ModuleVersion {
                        major,
                        minor,
                        patch,
                    },
                    EnforcementLevel::from_wire(level).unwrap(),
                    VersionStrictness::from_wire(strict).unwrap(),
                )
            })
    }

    proptest! {
        #[test]
        fn roundtrip_legacy_fields(
            modules in prop::collection::vec(arb_descriptor(), 0..8),
            freeform in "[ -~]{0,24}",
            protocol in any::<u32>(),
            host in (0..10i32, 0..300i32, 0..100i32),
        ) {
            let inv = ModuleInventory::new(
                HostInfo {
                    version: ModuleVersion::new(host.0, host.1, host.2),
                    network_protocol_version: protocol,
                    freeform_version: freeform,
                },
                modules,
            );
            let mut pkg = encode(&inv).unwrap();
            let decoded = decode(&mut pkg).unwrap();
            prop_assert_eq!(decoded.host(), inv.host());
            prop_assert_eq!(decoded.modules().len(), inv.modules().len());
            for (a, b) in decoded.modules().iter().zip(inv.modules()) {
                prop_assert_eq!(a.id(), b.id());
                prop_assert_eq!(a.name(), b.name());
                prop_assert_eq!(a.version(), b.version());
                prop_assert_eq!(a.enforcement(), b.enforcement());
                prop_assert_eq!(a.strictness(), b.strictness());
            }
        }

        #[test]
        fn truncation_never_panics(cut in 0usize..200) {
            let bytes = encode(&sample()).unwrap().into_bytes();
            let cut = cut.min(bytes.len());
            let mut pkg = Package::from_bytes(bytes[..cut].to_vec());
            let _ = decode(&mut pkg);
        }
    }
}
