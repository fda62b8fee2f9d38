//! Inventory comparison: classify every difference between two peers' modules.

use std::fmt::{self, Write as _};

use crate::descriptor::{
    EnforcementLevel, ModuleDescriptor, ModuleVersion, Role, VersionStrictness,
    MAX_SUPPORTED_LAYOUT,
};
use crate::inventory::ModuleInventory;

/// Which of the two compared inventories a finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Reference,
    Candidate,
}

/// One discrepancy between the reference and candidate inventories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// `side` uses a layout revision newer than this build understands.
    UnsupportedLayout { side: Side, layout: Option<i32> },
    LayoutMismatch { reference: i32, candidate: i32 },
    ProtocolMismatch { reference: u32, candidate: u32 },
    HostVersionMismatch {
        reference: ModuleVersion,
        candidate: ModuleVersion,
    },
    /// Required on the candidate's role, present only in the reference.
    MissingModule(ModuleDescriptor),
    /// `module` is `side`'s descriptor, older than `required` at `strictness`.
    VersionBehind {
        side: Side,
        module: ModuleDescriptor,
        required: ModuleVersion,
        strictness: VersionStrictness,
        enforcement: EnforcementLevel,
    },
    /// Required on the reference's role, present only in the candidate.
    UnexpectedModule(ModuleDescriptor),
}

impl Finding {
    /// Lower sorts first in a report.
    pub fn severity(&self) -> u8 {
        match self {
            Finding::UnsupportedLayout { .. } => 0,
            Finding::LayoutMismatch { .. } => 1,
            Finding::ProtocolMismatch { .. } | Finding::HostVersionMismatch { .. } => 2,
            Finding::MissingModule(_) => 3,
            Finding::VersionBehind { .. } => 4,
            Finding::UnexpectedModule(_) => 5,
        }
    }

    /// Whether this finding alone forces the connection to be rejected.
    /// Version differences on modules that are only version-checked (or not enforced) do not,
    /// and a differing host build is informational.
    pub fn is_blocking(&self) -> bool {
        match self {
            Finding::HostVersionMismatch { .. } => false,
            Finding::VersionBehind { enforcement, .. } => matches!(
                enforcement,
                EnforcementLevel::EveryoneMustHave
                    | EnforcementLevel::ServerMustHave
                    | EnforcementLevel::ClientMustHave
            ),
            _ => true,
        }
    }
}

/// Result of [`compare`]. Findings are kept in severity order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityReport {
    reference_role: Role,
    findings: Vec<Finding>,
}

impl CompatibilityReport {
    pub fn new(reference_role: Role, mut findings: Vec<Finding>) -> Self {
        findings.sort_by_key(Finding::severity);
        Self {
            reference_role,
            findings,
        }
    }

    pub fn reference_role(&self) -> Role {
        self.reference_role
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn is_compatible(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn requires_rejection(&self) -> bool {
        self.findings.iter().any(Finding::is_blocking)
    }

    fn role_of(&self, side: Side) -> Role {
        match side {
            Side::Reference => self.reference_role,
            Side::Candidate => self.reference_role.peer(),
        }
    }

    /// Human-readable diagnostic, one finding per line.
    pub fn render(&self) -> String {
        if self.findings.is_empty() {
            return "All modules are compatible.\n".to_string();
        }
        let reference = self.reference_role;
        let candidate = reference.peer();
        let mut out = String::from("Module compatibility check failed:\n");
        for f in &self.findings {
            let _ = match f {
                Finding::UnsupportedLayout { side, layout } => writeln!(
                    out,
                    "- {} uses module layout {}, this build supports up to {}",
                    Capitalized(self.role_of(*side)),
                    layout.unwrap_or(0),
                    MAX_SUPPORTED_LAYOUT
                ),
                Finding::LayoutMismatch {
                    reference: r,
                    candidate: c,
                } => writeln!(
                    out,
                    "- Module layout differs: {reference} uses {r}, {candidate} uses {c}"
                ),
                Finding::ProtocolMismatch {
                    reference: r,
                    candidate: c,
                } => writeln!(
                    out,
                    "- Network protocol differs: {reference} uses {r}, {candidate} uses {c}"
                ),
                Finding::HostVersionMismatch {
                    reference: r,
                    candidate: c,
                } => writeln!(
                    out,
                    "- Version differs: {reference} runs {r}, {candidate} runs {c}"
                ),
                Finding::MissingModule(m) => writeln!(
                    out,
                    "- Missing {} {}: required by the {reference}",
                    m.name(),
                    m.version()
                ),
                Finding::VersionBehind {
                    side,
                    module,
                    required,
                    strictness,
                    ..
                } => writeln!(
                    out,
                    "- {} has {} {}, needs {} (checked to {} level)",
                    Capitalized(self.role_of(*side)),
                    module.name(),
                    module.version(),
                    required,
                    strictness
                ),
                Finding::UnexpectedModule(m) => writeln!(
                    out,
                    "- {} {} is not installed on the {reference}",
                    m.name(),
                    m.version()
                ),
            };
        }
        out
    }
}

struct Capitalized(Role);

impl fmt::Display for Capitalized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Role::Host => f.write_str("Host"),
            Role::Participant => f.write_str("Participant"),
        }
    }
}

/// True if `a` is older than `b` when both are truncated to `strictness`.
pub fn is_behind(a: ModuleVersion, b: ModuleVersion, strictness: VersionStrictness) -> bool {
    a.truncated(strictness) < b.truncated(strictness)
}

/// Descriptors that lookups resolve to: an entry shadowed by a later one with the same id
/// is skipped.
fn effective(inv: &ModuleInventory) -> impl Iterator<Item = &ModuleDescriptor> {
    inv.modules()
        .iter()
        .filter(move |m| inv.find(m.id()).is_some_and(|last| std::ptr::eq(last, *m)))
}

/// Compare `candidate` against `reference`. The candidate plays `reference_role.peer()`.
pub fn compare(
    reference: &ModuleInventory,
    candidate: &ModuleInventory,
    reference_role: Role,
) -> CompatibilityReport {
    let candidate_role = reference_role.peer();
    let mut findings = Vec::new();

    for (side, inv) in [(Side::Reference, reference), (Side::Candidate, candidate)] {
        if !inv.is_supported_layout() {
            findings.push(Finding::UnsupportedLayout {
                side,
                layout: inv.layout_version(),
            });
        }
    }
    if !findings.is_empty() {
        return CompatibilityReport::new(reference_role, findings);
    }

    if let (Some(r), Some(c)) = (reference.layout_version(), candidate.layout_version()) {
        if r != c {
            findings.push(Finding::LayoutMismatch {
                reference: r,
                candidate: c,
            });
        }
    }

    let (rp, cp) = (
        reference.network_protocol_version(),
        candidate.network_protocol_version(),
    );
    if rp != 0 && cp != 0 && rp != cp {
        findings.push(Finding::ProtocolMismatch {
            reference: rp,
            candidate: cp,
        });
    }
    if reference.host_version() != candidate.host_version() {
        findings.push(Finding::HostVersionMismatch {
            reference: reference.host_version(),
            candidate: candidate.host_version(),
        });
    }

    for m in effective(reference) {
        if m.is_required_on(candidate_role) && !candidate.contains(m.id()) {
            findings.push(Finding::MissingModule(m.clone()));
        }
    }

    for m in effective(candidate) {
        if m.is_required_on(reference_role) && !reference.contains(m.id()) {
            findings.push(Finding::UnexpectedModule(m.clone()));
        }
    }

    for r in effective(reference) {
        let Some(c) = candidate.find(r.id()) else {
            continue;
        };
        let strictness = r.strictness();
        let behind = if is_behind(c.version(), r.version(), strictness) {
            Some((Side::Candidate, c, r.version()))
        } else if is_behind(r.version(), c.version(), strictness) {
            Some((Side::Reference, r, c.version()))
        } else {
            None
        };
        if let Some((side, module, required)) = behind {
            findings.push(Finding::VersionBehind {
                side,
                module: module.clone(),
                required,
                strictness,
                enforcement: r.enforcement(),
            });
        }
    }

    CompatibilityReport::new(reference_role, findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ModuleDescriptor;
    use crate::inventory::HostInfo;
    use proptest::prelude::*;

    fn module(
        id: &str,
        version: ModuleVersion,
        enforcement: EnforcementLevel,
        strictness: VersionStrictness,
    ) -> ModuleDescriptor {
        ModuleDescriptor::new(id, id, version, enforcement, strictness)
    }

    fn inventory(modules: Vec<ModuleDescriptor>) -> ModuleInventory {
        ModuleInventory::new(HostInfo::default(), modules)
    }

    fn single(version: ModuleVersion, strictness: VersionStrictness) -> ModuleInventory {
        inventory(vec![module(
            "m",
            version,
            EnforcementLevel::EveryoneMustHave,
            strictness,
        )])
    }

    fn single_named(id: &str, version: ModuleVersion) -> ModuleInventory {
        inventory(vec![module(
            id,
            version,
            EnforcementLevel::EveryoneMustHave,
            VersionStrictness::Major,
        )])
    }

    fn behind_side(report: &CompatibilityReport) -> Option<Side> {
        report.findings().iter().find_map(|f| match f {
            Finding::VersionBehind { side, .. } => Some(*side),
            _ => None,
        })
    }

    #[test]
    fn minor_difference_tiers() {
        let reference = ModuleVersion::new(1, 5, 2);
        let candidate = ModuleVersion::new(1, 4, 9);
        let at = |s| {
            let r = single(reference, s);
            let c = single(candidate, s);
            behind_side(&compare(&r, &c, Role::Host))
        };
        assert_eq!(at(VersionStrictness::None), None);
        assert_eq!(at(VersionStrictness::Major), None);
        assert_eq!(at(VersionStrictness::Minor), Some(Side::Candidate));
        assert_eq!(at(VersionStrictness::Patch), Some(Side::Candidate));
    }

    #[test]
    fn patch_difference_fires_only_at_patch() {
        let reference = ModuleVersion::new(1, 5, 2);
        let candidate = ModuleVersion::new(1, 5, 1);
        for s in [
            VersionStrictness::None,
            VersionStrictness::Major,
            VersionStrictness::Minor,
        ] {
            let report = compare(&single(reference, s), &single(candidate, s), Role::Host);
            assert!(report.is_compatible(), "{s:?}");
        }
        let report = compare(
            &single(reference, VersionStrictness::Patch),
            &single(candidate, VersionStrictness::Patch),
            Role::Host,
        );
        assert_eq!(behind_side(&report), Some(Side::Candidate));
    }

    #[test]
    fn reference_can_be_the_one_behind() {
        let r = single(ModuleVersion::new(1, 0, 0), VersionStrictness::Major);
        let c = single(ModuleVersion::new(2, 0, 0), VersionStrictness::Major);
        let report = compare(&r, &c, Role::Host);
        match &report.findings()[0] {
            Finding::VersionBehind {
                side,
                module,
                required,
                ..
            } => {
                assert_eq!(*side, Side::Reference);
                assert_eq!(module.version(), ModuleVersion::new(1, 0, 0));
                assert_eq!(*required, ModuleVersion::new(2, 0, 0));
            }
            other => panic!("unexpected finding {other:?}"),
        }
        assert!(report.requires_rejection());
    }

    #[test]
    fn reference_strictness_governs() {
        let r = single(ModuleVersion::new(1, 5, 0), VersionStrictness::None);
        let c = single(ModuleVersion::new(1, 4, 0), VersionStrictness::Patch);
        assert!(compare(&r, &c, Role::Host).is_compatible());
    }

    #[test]
    fn missing_patch_counts_as_zero() {
        let r = single(ModuleVersion::without_patch(1, 2), VersionStrictness::Patch);
        let c = single(ModuleVersion::new(1, 2, 0), VersionStrictness::Patch);
        assert!(compare(&r, &c, Role::Host).is_compatible());
    }

    #[test]
    fn server_must_have_is_asymmetric() {
        let with = inventory(vec![module(
            "core",
            ModuleVersion::new(1, 2, 0),
            EnforcementLevel::ServerMustHave,
            VersionStrictness::Minor,
        )]);
        let without = inventory(vec![]);

        let report = compare(&with, &without, Role::Host);
        assert_eq!(report.findings().len(), 1);
        assert!(matches!(&report.findings()[0], Finding::MissingModule(m) if m.id() == "core"));

        // Participant runs it, host does not: nothing to report.
        let report = compare(&with, &without, Role::Participant);
        assert!(report.is_compatible());
        let report = compare(&without, &with, Role::Host);
        assert!(report.is_compatible());
    }

    #[test]
    fn client_must_have_is_unexpected_on_host() {
        let host = inventory(vec![]);
        let participant = inventory(vec![module(
            "hud",
            ModuleVersion::new(0, 3, 0),
            EnforcementLevel::ClientMustHave,
            VersionStrictness::None,
        )]);
        let report = compare(&host, &participant, Role::Host);
        assert!(
            matches!(&report.findings()[..], [Finding::UnexpectedModule(m)] if m.id() == "hud")
        );
        assert!(report.requires_rejection());
    }

    #[test]
    fn version_check_only_mismatch_does_not_block() {
        let r = inventory(vec![module(
            "maps",
            ModuleVersion::new(2, 0, 0),
            EnforcementLevel::VersionCheckOnly,
            VersionStrictness::Major,
        )]);
        let c = inventory(vec![module(
            "maps",
            ModuleVersion::new(1, 0, 0),
            EnforcementLevel::VersionCheckOnly,
            VersionStrictness::Major,
        )]);
        let report = compare(&r, &c, Role::Host);
        assert!(!report.is_compatible());
        assert!(!report.requires_rejection());

        // Absent on one side is never a finding for a version-check-only module.
        assert!(compare(&r, &inventory(vec![]), Role::Host).is_compatible());
    }

    #[test]
    fn unsupported_layout_stops_other_checks() {
        let newer = inventory(vec![ModuleDescriptor::from_record(
            "x",
            "x",
            ModuleVersion::new(9, 0, 0),
            EnforcementLevel::EveryoneMustHave,
            VersionStrictness::Patch,
            MAX_SUPPORTED_LAYOUT + 1,
        )]);
        let ours = single(ModuleVersion::new(1, 0, 0), VersionStrictness::Patch);
        let report = compare(&ours, &newer, Role::Host);
        assert_eq!(
            report.findings(),
            &[Finding::UnsupportedLayout {
                side: Side::Candidate,
                layout: Some(MAX_SUPPORTED_LAYOUT + 1),
            }]
        );
        assert!(report.requires_rejection());
    }

    #[test]
    fn older_layout_is_a_mismatch() {
        let legacy = inventory(vec![ModuleDescriptor::from_record(
            "m",
            "m",
            ModuleVersion::new(1, 0, 0),
            EnforcementLevel::EveryoneMustHave,
            VersionStrictness::Major,
            0,
        )]);
        let ours = single(ModuleVersion::new(1, 0, 0), VersionStrictness::Major);
        let report = compare(&ours, &legacy, Role::Host);
        assert_eq!(
            report.findings(),
            &[Finding::LayoutMismatch {
                reference: 1,
                candidate: 0
            }]
        );
    }

    #[test]
    fn host_metadata_checks() {
        let mut host = HostInfo {
            version: ModuleVersion::new(0, 217, 46),
            network_protocol_version: 33,
            freeform_version: String::new(),
        };
        let r = ModuleInventory::new(host.clone(), vec![]);
        host.network_protocol_version = 0;
        let unknown_protocol = ModuleInventory::new(host.clone(), vec![]);
        assert!(compare(&r, &unknown_protocol, Role::Host).is_compatible());

        host.network_protocol_version = 34;
        host.version = ModuleVersion::new(0, 218, 0);
        let other = ModuleInventory::new(host, vec![]);
        let report = compare(&r, &other, Role::Host);
        assert_eq!(report.findings().len(), 2);
        assert!(report.requires_rejection());
    }

    #[test]
    fn host_build_difference_alone_does_not_reject() {
        let modules = vec![module(
            "x",
            ModuleVersion::new(2, 0, 0),
            EnforcementLevel::EveryoneMustHave,
            VersionStrictness::Major,
        )];
        let host = |patch| HostInfo {
            version: ModuleVersion::new(0, 217, patch),
            network_protocol_version: 33,
            freeform_version: String::new(),
        };
        let r = ModuleInventory::new(host(46), modules.clone());
        let c = ModuleInventory::new(host(47), modules);
        let report = compare(&r, &c, Role::Host);
        assert!(matches!(
            report.findings(),
            [Finding::HostVersionMismatch { .. }]
        ));
        assert!(!report.requires_rejection());
    }

    #[test]
    fn shadowed_duplicates_are_ignored() {
        let r = inventory(vec![
            module(
                "core",
                ModuleVersion::new(1, 0, 0),
                EnforcementLevel::EveryoneMustHave,
                VersionStrictness::Major,
            ),
            module(
                "core",
                ModuleVersion::new(2, 0, 0),
                EnforcementLevel::EveryoneMustHave,
                VersionStrictness::Major,
            ),
        ]);
        let c = single_named("core", ModuleVersion::new(2, 0, 0));
        assert!(compare(&r, &c, Role::Host).is_compatible());

        let report = compare(&r, &inventory(vec![]), Role::Host);
        assert!(matches!(
            report.findings(),
            [Finding::MissingModule(m)] if m.version() == ModuleVersion::new(2, 0, 0)
        ));
    }

    #[test]
    fn findings_sorted_by_severity() {
        let r = inventory(vec![
            module(
                "a",
                ModuleVersion::new(2, 0, 0),
                EnforcementLevel::EveryoneMustHave,
                VersionStrictness::Major,
            ),
            module(
                "b",
                ModuleVersion::new(1, 0, 0),
                EnforcementLevel::EveryoneMustHave,
                VersionStrictness::Major,
            ),
        ]);
        let c = inventory(vec![
            module(
                "c",
                ModuleVersion::new(1, 0, 0),
                EnforcementLevel::EveryoneMustHave,
                VersionStrictness::Major,
            ),
            module(
                "a",
                ModuleVersion::new(1, 0, 0),
                EnforcementLevel::EveryoneMustHave,
                VersionStrictness::Major,
            ),
        ]);
        let report = compare(&r, &c, Role::Host);
        let order: Vec<u8> = report.findings().iter().map(Finding::severity).collect();
        assert_eq!(order, vec![3, 4, 5]);

        let text = report.render();
        let missing = text.find("Missing b").unwrap();
        let behind = text.find("Participant has a 1.0.0, needs 2.0.0").unwrap();
        let unexpected = text.find("c 1.0.0 is not installed on the host").unwrap();
        assert!(missing < behind && behind < unexpected);
    }

    fn arb_version() -> impl Strategy<Value = ModuleVersion> {
        (0..5i32, 0..5i32, prop::option::of(0..5i32)).prop_map(|(major, minor, patch)| {
            ModuleVersion {
                major,
                minor,
                patch,
            }
        })
    }

    proptest! {
        #[test]
        fn strictness_none_never_reports(a in arb_version(), b in arb_version()) {
            let r = single(a, VersionStrictness::None);
            let c = single(b, VersionStrictness::None);
            prop_assert!(compare(&r, &c, Role::Host).is_compatible());
        }

        #[test]
        fn at_most_one_side_is_behind(
            a in arb_version(),
            b in arb_version(),
            s in 0..4i32,
        ) {
            let s = VersionStrictness::from_wire(s).unwrap();
            prop_assert!(!(is_behind(a, b, s) && is_behind(b, a, s)));
        }
    }
}
