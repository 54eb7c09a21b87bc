use treacle_engine::target::{resolve, ProxyEndpoint, Scheme, TargetError, TargetUrl};

#[test]
fn test_parse_http_defaults() {
    let t = TargetUrl::parse("http://victim.example").unwrap();
    assert_eq!(t.scheme, Scheme::Http);
    assert_eq!(t.host, "victim.example");
    assert_eq!(t.port, 80);
    assert_eq!(t.path, "/");
    assert!(!t.is_tls());
}

#[test]
fn test_parse_https_defaults() {
    let t = TargetUrl::parse("https://victim.example").unwrap();
    assert_eq!(t.scheme, Scheme::Https);
    assert_eq!(t.port, 443);
    assert!(t.is_tls());
}

#[test]
fn test_parse_scheme_is_case_insensitive() {
    assert!(TargetUrl::parse("HTTP://victim.example/").is_ok());
    assert!(TargetUrl::parse("HtTpS://victim.example/").unwrap().is_tls());
}

#[test]
fn test_parse_keeps_port_path_and_query() {
    let t = TargetUrl::parse("http://victim.example:8080/a/b?c=d").unwrap();
    assert_eq!(t.port, 8080);
    assert_eq!(t.path, "/a/b?c=d");
}

#[test]
fn test_parse_ipv6_literal() {
    let t = TargetUrl::parse("http://[2001:db8::1]:8080/x").unwrap();
    assert_eq!(t.host, "2001:db8::1");
    assert_eq!(t.port, 8080);
    assert_eq!(t.host_header(), "[2001:db8::1]:8080");
    assert_eq!(t.absolute(), "http://[2001:db8::1]:8080/x");
}

#[test]
fn test_parse_ipv6_default_port() {
    let t = TargetUrl::parse("https://[::1]/").unwrap();
    assert_eq!(t.host, "::1");
    assert_eq!(t.port, 443);
    assert_eq!(t.host_header(), "[::1]");
}

#[test]
fn test_parse_rejects_other_schemes() {
    assert!(matches!(
        TargetUrl::parse("ftp://victim.example/"),
        Err(TargetError::UnsupportedScheme(_))
    ));
    assert!(TargetUrl::parse("victim.example").is_err());
    assert!(TargetUrl::parse("").is_err());
}

#[test]
fn test_parse_rejects_bad_ports() {
    assert!(matches!(
        TargetUrl::parse("http://victim.example:70000/"),
        Err(TargetError::InvalidPort(_))
    ));
    assert!(TargetUrl::parse("http://victim.example:abc/").is_err());
}

#[test]
fn test_parse_rejects_missing_host() {
    assert!(matches!(
        TargetUrl::parse("http:///path"),
        Err(TargetError::MissingHost(_))
    ));
}

#[test]
fn test_parse_rejects_unterminated_v6() {
    assert!(matches!(
        TargetUrl::parse("http://[::1/"),
        Err(TargetError::UnterminatedV6(_))
    ));
}

#[test]
fn test_host_header_hides_well_known_ports_only() {
    assert_eq!(
        TargetUrl::parse("http://x/").unwrap().host_header(),
        "x"
    );
    assert_eq!(
        TargetUrl::parse("https://x/").unwrap().host_header(),
        "x"
    );
    assert_eq!(
        TargetUrl::parse("http://x:8080/").unwrap().host_header(),
        "x:8080"
    );
    // 443 on a plain-HTTP URL still counts as well known for the header
    assert_eq!(
        TargetUrl::parse("http://x:443/").unwrap().host_header(),
        "x"
    );
}

#[test]
fn test_absolute_appends_port_unless_scheme_default() {
    assert_eq!(
        TargetUrl::parse("http://x/").unwrap().absolute(),
        "http://x/"
    );
    assert_eq!(
        TargetUrl::parse("https://x:8443/p").unwrap().absolute(),
        "https://x:8443/p"
    );
    // not the default port for http, so the port shows
    assert_eq!(
        TargetUrl::parse("http://x:443/").unwrap().absolute(),
        "http://x:443/"
    );
}

#[test]
fn test_display_matches_absolute() {
    let t = TargetUrl::parse("https://victim.example:8443/res").unwrap();
    assert_eq!(t.to_string(), t.absolute());
}

#[test]
fn test_proxy_endpoint_parsing() {
    let p = ProxyEndpoint::parse("proxy.local:3128").unwrap();
    assert_eq!(p.host, "proxy.local");
    assert_eq!(p.port, 3128);

    let p = ProxyEndpoint::parse("proxy.local").unwrap();
    assert_eq!(p.port, 80);

    let p = ProxyEndpoint::parse("[::1]:8080").unwrap();
    assert_eq!(p.host, "::1");
    assert_eq!(p.port, 8080);

    assert!(ProxyEndpoint::parse("").is_err());
    assert!(ProxyEndpoint::parse("proxy.local:no").is_err());
}

#[test]
fn test_proxy_endpoint_display() {
    let p = ProxyEndpoint::parse("proxy.local:3128").unwrap();
    assert_eq!(p.to_string(), "proxy.local:3128");
}

#[test]
fn test_resolve_loopback_literal() {
    let addrs = resolve("127.0.0.1", 8080).unwrap();
    assert!(!addrs.is_empty());
    assert_eq!(addrs[0].port(), 8080);
    assert!(addrs[0].ip().is_loopback());
}
