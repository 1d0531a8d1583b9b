//! Parsing and encoding of compressed hostlists such as `rabbit[01-04,7],login1`.
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::multi::separated_list1;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

use crate::Set;

/// Inclusive numeric range with the zero-padding width of its first bound.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HostRange {
    start: u64,
    end: u64,
    width: usize,
}

#[derive(Debug)]
enum HostEntry<'a> {
    Plain(&'a str),
    Ranged {
        prefix: &'a str,
        ranges: Vec<HostRange>,
        suffix: &'a str,
    },
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn p_range(input: &str) -> IResult<&str, HostRange> {
    map_res(
        pair(digit1, opt(preceded(char('-'), digit1))),
        |(start, end): (&str, Option<&str>)| {
            let width = start.len();
            let start_value = start.parse::<u64>()?;
            let end_value = match end {
                Some(end) => end.parse::<u64>()?,
                None => start_value,
            };
            if end_value < start_value {
                return Err(anyhow::anyhow!("range {start_value}-{end_value} is decreasing"));
            }
            Ok::<_, anyhow::Error>(HostRange {
                start: start_value,
                end: end_value,
                width,
            })
        },
    )(input)
}

fn p_ranged_entry(input: &str) -> IResult<&str, HostEntry<'_>> {
    map(
        tuple((
            opt(take_while1(is_host_char)),
            delimited(char('['), separated_list1(char(','), p_range), char(']')),
            opt(take_while1(is_host_char)),
        )),
        |(prefix, ranges, suffix)| HostEntry::Ranged {
            prefix: prefix.unwrap_or_default(),
            ranges,
            suffix: suffix.unwrap_or_default(),
        },
    )(input)
}

fn p_entry(input: &str) -> IResult<&str, HostEntry<'_>> {
    alt((p_ranged_entry, map(take_while1(is_host_char), HostEntry::Plain)))(input)
}

/// Expands a hostlist into individual hostnames, preserving order (duplicates included).
pub fn expand_hostlist(input: &str) -> anyhow::Result<Vec<String>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }
    let (_, entries) = all_consuming(separated_list1(char(','), p_entry))(input)
        .map_err(|e| anyhow::anyhow!("Invalid hostlist '{input}': {e}"))?;

    let mut hosts = Vec::new();
    for entry in entries {
        match entry {
            HostEntry::Plain(host) => hosts.push(host.to_string()),
            HostEntry::Ranged {
                prefix,
                ranges,
                suffix,
            } => {
                for range in ranges {
                    for n in range.start..=range.end {
                        hosts.push(format!("{prefix}{n:0width$}{suffix}", width = range.width));
                    }
                }
            }
        }
    }
    Ok(hosts)
}

/// Expands a hostlist and drops repeated hostnames, keeping the first occurrence.
pub fn expand_unique(input: &str) -> anyhow::Result<Vec<String>> {
    let mut seen = Set::new();
    Ok(expand_hostlist(input)?
        .into_iter()
        .filter(|host| seen.insert(host.clone()))
        .collect())
}

/// Splits `node012` into `("node", Some((12, 3)))`.
fn split_numeric_suffix(host: &str) -> (&str, Option<(u64, usize)>) {
    let digits = host.len() - host.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return (host, None);
    }
    let (prefix, number) = host.split_at(host.len() - digits);
    match number.parse::<u64>() {
        Ok(value) => (prefix, Some((value, digits))),
        Err(_) => (host, None),
    }
}

/// Encodes hostnames into the compressed form. Adjacent hosts that share a prefix and
/// padding are merged into one bracketed group, the order of the input is kept.
pub fn encode_hostlist<S: AsRef<str>>(hosts: &[S]) -> String {
    enum Segment<'a> {
        Plain(&'a str),
        Group {
            prefix: &'a str,
            width: usize,
            numbers: Vec<u64>,
        },
    }

    let mut segments: Vec<Segment> = Vec::new();
    for host in hosts {
        let host = host.as_ref();
        let (prefix, Some((number, width))) = split_numeric_suffix(host) else {
            segments.push(Segment::Plain(host));
            continue;
        };
        match segments.last_mut() {
            Some(Segment::Group {
                prefix: last_prefix,
                width: last_width,
                numbers,
            }) if *last_prefix == prefix && *last_width == width => numbers.push(number),
            _ => segments.push(Segment::Group {
                prefix,
                width,
                numbers: vec![number],
            }),
        }
    }

    segments
        .iter()
        .map(|segment| match segment {
            Segment::Plain(name) => name.to_string(),
            Segment::Group {
                prefix,
                width,
                numbers,
            } => {
                let width = *width;
                if let [single] = numbers.as_slice() {
                    return format!("{prefix}{single:0width$}");
                }
                let mut ranges: Vec<(u64, u64)> = Vec::new();
                for &n in numbers {
                    match ranges.last_mut() {
                        Some((_, end)) if n == *end + 1 => *end = n,
                        _ => ranges.push((n, n)),
                    }
                }
                let ranges = ranges
                    .into_iter()
                    .map(|(start, end)| {
                        if start == end {
                            format!("{start:0width$}")
                        } else {
                            format!("{start:0width$}-{end:0width$}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{prefix}[{ranges}]")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::{encode_hostlist, expand_hostlist, expand_unique};

    #[test]
    fn expand_plain_hosts() {
        assert_eq!(expand_hostlist("a,b").unwrap(), vec!["a", "b"]);
        assert!(expand_hostlist("").unwrap().is_empty());
    }

    #[test]
    fn expand_ranges_with_padding() {
        assert_eq!(
            expand_hostlist("rabbit[01-03,7],login1").unwrap(),
            vec!["rabbit01", "rabbit02", "rabbit03", "rabbit7", "login1"]
        );
        assert_eq!(
            expand_hostlist("n[8-10]-ib").unwrap(),
            vec!["n8-ib", "n9-ib", "n10-ib"]
        );
    }

    #[test]
    fn expand_invalid() {
        assert!(expand_hostlist("node[3-1]").is_err());
        assert!(expand_hostlist("node[1-").is_err());
        assert!(expand_hostlist("node,,x").is_err());
    }

    #[test]
    fn expand_unique_keeps_first() {
        assert_eq!(
            expand_unique("c[1-2],c1,c3").unwrap(),
            vec!["c1", "c2", "c3"]
        );
    }

    #[test]
    fn encode_groups_adjacent_hosts() {
        assert_eq!(
            encode_hostlist(&["rabbit01", "rabbit02", "rabbit03", "rabbit07"]),
            "rabbit[01-03,07]"
        );
        assert_eq!(encode_hostlist(&["login", "c1"]), "login,c1");
        assert_eq!(encode_hostlist(&["c1", "c2", "d5"]), "c[1-2],d5");
        assert_eq!(encode_hostlist::<&str>(&[]), "");
    }

    #[test]
    fn encode_then_expand_preserves_hosts() {
        let hosts = vec!["x9", "x10", "x11", "y", "x12"];
        let encoded = encode_hostlist(&hosts);
        assert_eq!(expand_hostlist(&encoded).unwrap(), hosts);
    }

    #[test]
    fn mixed_widths_stay_apart() {
        let hosts = vec!["rabbit01", "rabbit02", "rabbit7"];
        let encoded = encode_hostlist(&hosts);
        assert_eq!(encoded, "rabbit[01-02],rabbit7");
        assert_eq!(expand_hostlist(&encoded).unwrap(), hosts);
        assert_eq!(expand_hostlist("rabbit[01-02,7]").unwrap(), hosts);
    }
}
