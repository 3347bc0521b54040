use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::acl::{apply_all, Decision, FileStat, ProcessSnapshot};
use crate::config::Config;
use crate::rules::AclRule;

fn allow_config() -> Config {
    Config {
        default_policy_allow: true,
        ..Config::default()
    }
}

fn deny_config() -> Config {
    Config {
        default_policy_allow: false,
        ..Config::default()
    }
}

fn caller() -> ProcessSnapshot {
    ProcessSnapshot::with_exe(4242, Some(PathBuf::from("/bin/true")))
}

fn device_stat() -> FileStat {
    FileStat {
        uid: 0,
        gid: 0,
        mode: libc::S_IFCHR | 0o666,
    }
}

fn path_rule(pattern: &str) -> AclRule {
    AclRule {
        paths: vec![regex::Regex::new(pattern).unwrap()],
        ..AclRule::default()
    }
}

#[test]
fn empty_rule_list_follows_default_policy() {
    let mut stat = device_stat();
    let decision = apply_all(&allow_config(), &[], "/null", &caller(), 0, 0, &mut stat).unwrap();
    assert_eq!(decision, Decision::Allow);

    let decision = apply_all(&deny_config(), &[], "/null", &caller(), 0, 0, &mut stat).unwrap();
    assert_eq!(decision, Decision::Hide);
}

#[test]
fn unmatched_path_is_hidden() {
    let rules = vec![path_rule("^/sda$")];
    let mut stat = device_stat();
    let decision =
        apply_all(&deny_config(), &rules, "/null", &caller(), 0, 0, &mut stat).unwrap();
    assert_eq!(decision, Decision::Hide);
}

#[test]
fn uid_gated_setmode_zeroes_for_the_named_caller_only() {
    // devices=^/null$ uid=1000 setmode=0
    let mut rule = path_rule("^/null$");
    rule.uid = Some(1000);
    rule.setmode = Some(0);
    let rules = vec![rule];

    // the named caller gets the override; mode drops to 0
    let mut stat = device_stat();
    let decision =
        apply_all(&deny_config(), &rules, "/null", &caller(), 1000, 1000, &mut stat).unwrap();
    assert_eq!(decision, Decision::Allow);
    assert_eq!(stat.mode & 0o777, 0);

    // any other caller still sees the entry, with the seeded bits intact
    let mut stat = device_stat();
    let decision =
        apply_all(&deny_config(), &rules, "/null", &caller(), 1001, 1001, &mut stat).unwrap();
    assert_eq!(decision, Decision::Allow);
    assert_eq!(stat.mode & 0o777, 0o666);
}

#[test]
fn setuid_applies_only_when_caller_uid_equals_match_uid() {
    let mut rule = path_rule("^/tty0$");
    rule.uid = Some(500);
    rule.setuid = Some(0);
    let rules = vec![rule];

    let mut stat = device_stat();
    apply_all(&allow_config(), &rules, "/tty0", &caller(), 500, 500, &mut stat).unwrap();
    assert_eq!(stat.uid, 0);

    let mut stat = device_stat();
    stat.uid = 7;
    apply_all(&allow_config(), &rules, "/tty0", &caller(), 501, 501, &mut stat).unwrap();
    assert_eq!(stat.uid, 7);
}

#[test]
fn setuid_without_match_uid_never_applies() {
    let mut rule = path_rule("^/tty0$");
    rule.setuid = Some(0);
    let rules = vec![rule];

    let mut stat = device_stat();
    stat.uid = 7;
    apply_all(&allow_config(), &rules, "/tty0", &caller(), 500, 500, &mut stat).unwrap();
    assert_eq!(stat.uid, 7);
}

#[test]
fn setgid_applies_only_when_caller_gid_equals_match_gid() {
    let mut rule = path_rule("^/audio$");
    rule.gid = Some(29);
    rule.setgid = Some(0);
    let rules = vec![rule];

    let mut stat = device_stat();
    stat.gid = 29;
    apply_all(&allow_config(), &rules, "/audio", &caller(), 0, 29, &mut stat).unwrap();
    assert_eq!(stat.gid, 0);

    let mut stat = device_stat();
    stat.gid = 29;
    apply_all(&allow_config(), &rules, "/audio", &caller(), 0, 30, &mut stat).unwrap();
    assert_eq!(stat.gid, 29);
}

#[test]
fn predicates_select_the_applying_rule() {
    // two overlapping rules; only the /bin/true predicate applies
    let mut never = path_rule("^/null$");
    never.predicate = Some("/bin/false".to_string());
    never.setmode = Some(0o600);

    let mut always = path_rule("^/null$");
    always.predicate = Some("/bin/true".to_string());
    always.setmode = Some(0o640);

    let rules = vec![never, always];
    let mut stat = device_stat();
    let decision =
        apply_all(&deny_config(), &rules, "/null", &caller(), 0, 0, &mut stat).unwrap();
    assert_eq!(decision, Decision::Allow);
    assert_eq!(stat.mode & 0o777, 0o640);
}

#[test]
fn binary_path_assertion_must_match() {
    let mut rule = path_rule("^/null$");
    rule.proc_path = Some("/bin/true".to_string());
    rule.setmode = Some(0o600);
    let rules = vec![rule];

    let mut stat = device_stat();
    apply_all(&allow_config(), &rules, "/null", &caller(), 0, 0, &mut stat).unwrap();
    assert_eq!(stat.mode & 0o777, 0o600);

    let other = ProcessSnapshot::with_exe(4242, Some(PathBuf::from("/bin/false")));
    let mut stat = device_stat();
    apply_all(&allow_config(), &rules, "/null", &other, 0, 0, &mut stat).unwrap();
    assert_eq!(stat.mode & 0o777, 0o666);
}

#[test]
fn inode_and_sha256_assertions_must_match() {
    use std::os::unix::fs::MetadataExt;

    let exe = PathBuf::from("/bin/true");
    let meta = std::fs::metadata(&exe).unwrap();
    let digest: [u8; 32] = Sha256::digest(std::fs::read(&exe).unwrap()).into();

    let mut rule = path_rule("^/null$");
    rule.proc_inode = Some(meta.ino());
    rule.proc_sha256 = Some(digest);
    rule.setmode = Some(0o600);
    let rules = vec![rule];

    let snapshot = ProcessSnapshot::with_exe(1, Some(exe));
    let mut stat = device_stat();
    apply_all(&allow_config(), &rules, "/null", &snapshot, 0, 0, &mut stat).unwrap();
    assert_eq!(stat.mode & 0o777, 0o600);

    // same path, wrong inode: the whole conjunction fails
    let mut wrong = path_rule("^/null$");
    wrong.proc_inode = Some(meta.ino() + 1);
    wrong.proc_sha256 = Some(digest);
    wrong.setmode = Some(0o600);
    let rules = vec![wrong];

    let snapshot = ProcessSnapshot::with_exe(1, Some(PathBuf::from("/bin/true")));
    let mut stat = device_stat();
    apply_all(&allow_config(), &rules, "/null", &snapshot, 0, 0, &mut stat).unwrap();
    assert_eq!(stat.mode & 0o777, 0o666);
}

#[test]
fn matching_rules_compose_in_order() {
    let mut first = path_rule("^/null$");
    first.setmode = Some(0o600);
    let mut second = path_rule("^/null$");
    second.setmode = Some(0o444);

    let rules = vec![first, second];
    let mut stat = device_stat();
    apply_all(&allow_config(), &rules, "/null", &caller(), 0, 0, &mut stat).unwrap();
    // the later rule wins the final word on the mode bits
    assert_eq!(stat.mode & 0o777, 0o444);
}

#[test]
fn evaluation_has_no_hidden_state() {
    let mut rule = path_rule("^/null$");
    rule.setmode = Some(0o640);
    let rules = vec![rule];

    for _ in 0..3 {
        let mut stat = device_stat();
        let decision =
            apply_all(&deny_config(), &rules, "/null", &caller(), 0, 0, &mut stat).unwrap();
        assert_eq!(decision, Decision::Allow);
        assert_eq!(stat.mode & 0o777, 0o640);
    }
}

#[test]
fn type_bits_survive_setmode() {
    let mut rule = path_rule("^/null$");
    rule.setmode = Some(0o640);
    let rules = vec![rule];

    let mut stat = device_stat();
    apply_all(&allow_config(), &rules, "/null", &caller(), 0, 0, &mut stat).unwrap();
    assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFCHR);
}
