use oomwatch::pipeline::record::{
    decode, encode, DecodeError, EncodingError, COMM_LEN, RECORD_SIZE, SCHEMA_VERSION,
};
use oomwatch::{Constraint, EnrichmentStatus, OomDecision, VictimTask};

fn decision(pid: u32, memcg_id: u64, constraint: Constraint, order: i32) -> OomDecision {
    let mut victim = VictimTask::new(pid, pid + 1, "stress-ng-vm", 524_288, 262_144)
        .with_rss_breakdown(200_000, 60_000, 2_144);
    victim.pgtables_bytes = 1 << 20;
    victim.uid = 1000;
    victim.oom_score_adj = -500;
    OomDecision {
        timestamp_ns: 42_000_000,
        chosen: Some(victim),
        memcg_id,
        constraint,
        order,
        totalpages: 4_194_304,
        chosen_points: 262_100,
    }
}

fn encoded(d: &OomDecision, producer: u16, seq: u64) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    encode(d, producer, seq, &mut buf).expect("encode should succeed");
    buf
}

#[test]
fn test_decode_reproduces_encoded_fields() {
    let contexts = [
        decision(100, 0, Constraint::None, 3),
        decision(200, 55, Constraint::Memcg, 1),
        decision(300, 0, Constraint::Cpuset, 0),
        decision(400, 9, Constraint::MemoryPolicy, 2),
    ];

    for (seq, d) in contexts.iter().enumerate() {
        let buf = encoded(d, 7, seq as u64);
        let event = decode(&buf).expect("valid record should decode");
        let victim = d.chosen.unwrap();

        assert_eq!(event.timestamp_ns, d.timestamp_ns);
        assert_eq!(event.producer, 7);
        assert_eq!(event.seq, seq as u64);
        assert_eq!(event.victim_pid, victim.pid);
        assert_eq!(event.victim_tgid, victim.tgid);
        assert_eq!(event.comm, victim.comm);
        assert_eq!(event.comm_bytes(), b"stress-ng-vm");
        assert_eq!(event.total_vm, victim.total_vm);
        assert_eq!(event.rss, victim.rss);
        assert_eq!(event.anon_rss, 200_000);
        assert_eq!(event.file_rss, 60_000);
        assert_eq!(event.shmem_rss, 2_144);
        assert_eq!(event.pgtables_bytes, 1 << 20);
        assert_eq!(event.memcg_id, d.memcg_id);
        assert_eq!(event.constraint, d.constraint);
        assert_eq!(event.order, d.order);
        assert_eq!(event.totalpages, d.totalpages);
        assert_eq!(event.chosen_points, Some(d.chosen_points));
        assert_eq!(event.uid, 1000);
        assert_eq!(event.oom_score_adj, -500);
        assert_eq!(event.enrichment_status, EnrichmentStatus::None, "encoder never sets enrichment");
        assert!(event.cgroup_path.is_none());
    }
}

#[test]
fn test_sysrq_kill_has_no_points() {
    let buf = encoded(&decision(300, 0, Constraint::None, -1), 0, 0);
    let event = decode(&buf).unwrap();

    assert!(event.is_sysrq());
    assert_eq!(event.chosen_points, None, "sysrq kills carry no score");
    // Points bytes are zeroed on the wire, not leaked.
    assert!(buf[80..88].iter().all(|&b| b == 0));
}

#[test]
fn test_header_layout() {
    let buf = encoded(&decision(100, 55, Constraint::Memcg, 1), 0x0102, 9);
    assert_eq!(buf[0], SCHEMA_VERSION);
    assert_eq!(buf[1], 3, "memcg constraint byte");
    assert_eq!(&buf[2..4], &[0x02, 0x01], "producer id is little-endian");
    assert_eq!(&buf[94..96], &[0, 0], "reserved bytes stay zero");
    assert_eq!(buf.len(), 128);
    assert_eq!(&buf[96..104], &200_000u64.to_le_bytes(), "anon rss follows the header block");
    assert_eq!(&buf[120..128], &(1u64 << 20).to_le_bytes(), "pgtables close the record");
}

#[test]
fn test_comm_truncated_with_terminator() {
    let mut d = decision(100, 0, Constraint::None, 0);
    d.chosen = Some(VictimTask::new(100, 100, "a-very-long-process-name", 1, 1));

    let event = decode(&encoded(&d, 0, 0)).unwrap();
    assert_eq!(event.comm_bytes(), b"a-very-long-pro", "15 bytes plus NUL");
}

#[test]
fn test_non_utf8_comm_survives_exactly() {
    // prctl(PR_SET_NAME) accepts arbitrary bytes.
    let mut raw = [0u8; COMM_LEN];
    raw[..3].copy_from_slice(&[0xff, 0xfe, b'a']);
    let mut d = decision(100, 0, Constraint::None, 0);
    let mut victim = d.chosen.unwrap();
    victim.comm = raw;
    d.chosen = Some(victim);

    let event = decode(&encoded(&d, 0, 0)).unwrap();
    assert_eq!(event.comm_bytes(), &[0xff, 0xfe, b'a'], "raw bytes, no replacement");
    assert_eq!(event.comm, raw);
    assert_eq!(event.comm_lossy(), "\u{fffd}\u{fffd}a", "display form is lossy");

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["comm"], "\u{fffd}\u{fffd}a");
}

#[test]
fn test_encoding_failures() {
    let mut no_victim = decision(100, 0, Constraint::None, 0);
    no_victim.chosen = None;
    let mut buf = [0xAAu8; RECORD_SIZE];
    assert_eq!(encode(&no_victim, 0, 0, &mut buf), Err(EncodingError::NoVictim));
    assert!(buf.iter().all(|&b| b == 0xAA), "failed encode leaves the buffer alone");

    let zero_pid = decision(0, 0, Constraint::None, 0);
    assert_eq!(encode(&zero_pid, 0, 0, &mut buf), Err(EncodingError::InvalidPid));

    let global_memcg = decision(100, 0, Constraint::Memcg, 0);
    assert_eq!(encode(&global_memcg, 0, 0, &mut buf), Err(EncodingError::ScopeMismatch));

    let bad_order = decision(100, 0, Constraint::None, -2);
    assert_eq!(encode(&bad_order, 0, 0, &mut buf), Err(EncodingError::InvalidOrder(-2)));
}

#[test]
fn test_decode_rejects_malformed_records() {
    let good = encoded(&decision(100, 55, Constraint::Memcg, 1), 0, 0);

    assert_eq!(decode(&good[..40]), Err(DecodeError::Length(40)));

    let mut future = good;
    future[0] = SCHEMA_VERSION + 1;
    assert_eq!(decode(&future), Err(DecodeError::Version(SCHEMA_VERSION + 1)));

    let mut constraint = good;
    constraint[1] = 9;
    assert_eq!(decode(&constraint), Err(DecodeError::Constraint(9)));

    let mut pid = good;
    pid[20..24].copy_from_slice(&0u32.to_le_bytes());
    assert_eq!(decode(&pid), Err(DecodeError::ZeroPid));

    let mut scope = good;
    scope[60..68].copy_from_slice(&0u64.to_le_bytes());
    assert_eq!(decode(&scope), Err(DecodeError::ScopeMismatch));

    let mut comm = good;
    comm[28..44].copy_from_slice(&[b'x'; 16]);
    assert_eq!(decode(&comm), Err(DecodeError::UnterminatedComm));
}

#[test]
fn test_decision_from_json() {
    let line = r#"{"chosen":{"pid":4242,"tgid":4242,"comm":"java","total_vm":100,"rss":50},
                   "memcg_id":77,"constraint":"memcg","order":0,"chosen_points":900}"#;
    let d: OomDecision = serde_json::from_str(line).expect("decision json should parse");

    let event = decode(&encoded(&d, 0, 0)).unwrap();
    assert_eq!(event.comm_lossy(), "java");
    assert_eq!(event.constraint, Constraint::Memcg);
    assert_eq!(event.chosen_points, Some(900));
    assert_eq!(event.uid, 0, "missing uid defaults to root");
}
