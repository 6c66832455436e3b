//! Parser for the `status` console command transcript.
//!
//! The transcript is free text. The lines we care about look like:
//!
//! ```text
//! udp/ip  : 169.254.173.35:13768  (local: 0.0.0.0:27015)  (public IP from Steam: 44.200.128.3)
//! sourcetv:  169.254.173.35:13768, delay 30.0s  (local: 0.0.0.0:27020)
//! players : 1 humans, 1 bots (25 max)
//! # userid name                uniqueid            connected ping loss state  adr
//! #      2 "Relay" BOT                       active
//! #      3 "someone"           [U:1:29162964]      00:20       60    0 active 169.254.249.16:18930
//! ```
//!
//! Occupancy counts every row of the players table, bot rows included.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub server_ip: Option<String>,
    pub server_port: Option<u16>,
    pub tv_ip: Option<String>,
    pub tv_port: Option<u16>,
    pub player_count: u32,
}

const ADDRESS_KEY: &str = "udp/ip";
const TV_KEY: &str = "sourcetv";
const PLAYERS_KEY: &str = "players";
const TABLE_HEADER: &str = "# userid";

/// Never fails; missing fields stay `None` / zero.
pub fn parse(transcript: &str) -> StatusReport {
    let mut report = StatusReport::default();
    let mut summary_count: Option<u32> = None;
    let mut table_rows: Option<u32> = None;

    let mut lines = transcript.lines().map(str::trim_end);
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();

        if let Some(value) = field_value(trimmed, ADDRESS_KEY) {
            if let Some((ip, port)) = first_address(value) {
                report.server_ip = Some(ip);
                report.server_port = port;
            }
        } else if let Some(value) = field_value(trimmed, TV_KEY) {
            if let Some((ip, port)) = first_address(value) {
                report.tv_ip = Some(ip);
                report.tv_port = port;
            }
        } else if let Some(value) = field_value(trimmed, PLAYERS_KEY) {
            summary_count = first_number(value);
        } else if trimmed.starts_with(TABLE_HEADER) {
            let mut rows = 0u32;
            for row in lines.by_ref() {
                let row = row.trim();
                if !row.starts_with('#') || row.eq_ignore_ascii_case("#end") {
                    break;
                }
                rows += 1;
            }
            table_rows = Some(table_rows.unwrap_or(0) + rows);
        }
    }

    report.player_count = table_rows.or(summary_count).unwrap_or(0);
    report
}

/// Value part of a `key : value` line, tolerating any spacing around the colon.
fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(key)?;
    let rest = rest.trim_start().strip_prefix(':')?;
    Some(rest.trim())
}

/// First `ip:port` token of a value, e.g. `169.254.173.35:13768,` -> ("169.254.173.35", 13768).
fn first_address(value: &str) -> Option<(String, Option<u16>)> {
    let token = value
        .split_whitespace()
        .next()?
        .trim_end_matches(|c| c == ',' || c == ';');
    let (ip, port) = match token.rsplit_once(':') {
        Some((ip, port)) => (ip, port.parse::<u16>().ok()),
        None => (token, None),
    };
    if ip.is_empty() || !ip.chars().all(|c| c.is_ascii_hexdigit() || c == '.') {
        return None;
    }
    Some((ip.to_string(), port))
}

fn first_number(value: &str) -> Option<u32> {
    let digits: String = value
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OCCUPIED: &str = "hostname: QuickServer | Virginia
version : 9543365/24 9543365 secure
udp/ip  : 169.254.173.35:13768  (local: 0.0.0.0:27015)  (public IP from Steam: 44.200.128.3)
steamid : [A:1:1871475725:44792] (90264374594008077)
account : not logged in  (No account specified)
map     : cp_badlands at: 0 x, 0 y, 0 z
tags    : cp
sourcetv:  169.254.173.35:13769, delay 30.0s  (local: 0.0.0.0:27020)
players : 1 humans, 1 bots (25 max)
edicts  : 426 used of 2048 max
# userid name                uniqueid            connected ping loss state  adr
#      2 \"QuickServer TV | Virginia @\" BOT                       active
#      3 \"sonikro\"           [U:1:29162964]      00:20       60    0 active 169.254.249.16:18930
";

    const RELAY_ONLY: &str = "hostname: QuickServer | Virginia
udp/ip  : 169.254.173.35:13768  (local: 0.0.0.0:27015)  (public IP from Steam: 44.200.128.3)
sourcetv:  169.254.173.35:13769, delay 30.0s  (local: 0.0.0.0:27020)
players : 0 humans, 1 bots (25 max)
edicts  : 416 used of 2048 max
# userid name                uniqueid            connected ping loss state  adr
#      2 \"QuickServer TV | Virginia @\" BOT                       active
";

    #[test]
    fn parses_endpoints_and_counts_rows() {
        let r = parse(OCCUPIED);
        assert_eq!(r.server_ip.as_deref(), Some("169.254.173.35"));
        assert_eq!(r.server_port, Some(13768));
        assert_eq!(r.tv_ip.as_deref(), Some("169.254.173.35"));
        assert_eq!(r.tv_port, Some(13769));
        assert_eq!(r.player_count, 2);
    }

    #[test]
    fn bot_rows_count_toward_occupancy() {
        assert_eq!(parse(RELAY_ONLY).player_count, 1);
    }

    #[test]
    fn header_without_rows_is_empty() {
        let t = "players : 0 humans, 0 bots (24 max)\n# userid name uniqueid connected ping loss state adr\n";
        assert_eq!(parse(t).player_count, 0);
    }

    #[test]
    fn table_ends_at_first_non_row_line_or_end_marker() {
        let t = "# userid name\n#  2 \"a\" BOT active\n#end\n#  3 \"stray\"\n";
        assert_eq!(parse(t).player_count, 1);

        let t = "# userid name\n#  2 \"a\" BOT active\nL 01/01/2025 - log line\n#  3 \"stray\"\n";
        assert_eq!(parse(t).player_count, 1);
    }

    #[test]
    fn falls_back_to_summary_line_without_a_table() {
        let t = "udp/ip  : 10.0.0.5:27015\nplayers : 7 humans, 0 bots (24 max)\n";
        let r = parse(t);
        assert_eq!(r.player_count, 7);
        assert_eq!(r.server_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(r.server_port, Some(27015));
        assert_eq!(r.tv_ip, None);
        assert_eq!(r.tv_port, None);
    }

    #[test]
    fn garbage_and_empty_input_yield_defaults() {
        assert_eq!(parse(""), StatusReport::default());
        assert_eq!(parse("Unknown command \"status\"\n"), StatusReport::default());
    }

    #[test]
    fn tolerates_windows_line_endings() {
        let t = OCCUPIED.replace('\n', "\r\n");
        let r = parse(&t);
        assert_eq!(r.player_count, 2);
        assert_eq!(r.tv_port, Some(13769));
    }

    #[test]
    fn malformed_port_keeps_the_ip() {
        let r = parse("udp/ip  : 10.1.2.3:notaport (local: 0.0.0.0:27015)\n");
        assert_eq!(r.server_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(r.server_port, None);
    }
}
