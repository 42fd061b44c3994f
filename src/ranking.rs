//! Extracts a ranked list of anonymous response labels from an evaluator's
//! free-form reply, and aggregates rankings across evaluators.
//!
//! The layered strategy below is a direct port of the original backend's
//! `parse_ranking_from_text`: each layer is a named function returning an
//! optional ordered list, and the composite returns the first non-empty
//! layer's output.

use std::collections::HashMap;

use regex::Regex;

/// `(\d+)[.\):\s]+\s*Response\s+([A-Z])`, case-insensitive.
fn numbered_pattern() -> Regex {
    Regex::new(r"(?i)(\d+)[.\):\s]+\s*Response\s+([A-Za-z])").expect("valid regex")
}

fn header_patterns() -> Vec<Regex> {
    vec![
        Regex::new(r"(?i)FINAL RANKING[:\s]*").unwrap(),
        Regex::new(r"(?i)MY RANKING[:\s]*").unwrap(),
        Regex::new(r"(?i)RANKING[:\s]*\n").unwrap(),
        Regex::new(r"(?i)RANKED ORDER[:\s]*").unwrap(),
    ]
}

fn bullet_pattern() -> Regex {
    Regex::new(r"(?i)[-•*]\s*Response\s+([A-Za-z])\s*(?:\(|$|\n)").expect("valid regex")
}

/// Extract rankings from a text section: consecutive numbered positions
/// starting at 1, stopping at the first gap. Requires at least two entries.
fn extract_ranking_from_section(section: &str) -> Vec<String> {
    let pattern = numbered_pattern();
    let mut ranking: HashMap<u32, char> = HashMap::new();

    for caps in pattern.captures_iter(section) {
        let Ok(num) = caps[1].parse::<u32>() else {
            continue;
        };
        if !(1..=10).contains(&num) {
            continue;
        }
        let letter = caps[2].chars().next().unwrap().to_ascii_uppercase();
        ranking.entry(num).or_insert(letter);
    }

    if ranking.is_empty() {
        return Vec::new();
    }

    let mut positions: Vec<u32> = ranking.keys().copied().collect();
    positions.sort_unstable();

    if positions[0] != 1 {
        return Vec::new();
    }

    let mut results = Vec::new();
    for (i, expected) in (1..=positions.len() as u32).enumerate() {
        if i < positions.len() && positions[i] == expected {
            results.push(format!("Response {}", ranking[&expected]));
        } else {
            break;
        }
    }

    if results.len() >= 2 {
        results
    } else {
        Vec::new()
    }
}

fn last_chars(text: &str, n: usize) -> &str {
    let char_count = text.chars().count();
    if char_count <= n {
        text
    } else {
        let skip = char_count - n;
        let byte_offset = text
            .char_indices()
            .nth(skip)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        &text[byte_offset..]
    }
}

fn first_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn explicit_header_scan(text: &str) -> Vec<String> {
    for header in header_patterns() {
        if let Some(m) = header.find(text) {
            let rest = &text[m.end()..];
            let section = first_chars(rest, 300);
            let results = extract_ranking_from_section(section);
            if !results.is_empty() {
                return results;
            }
        }
    }
    Vec::new()
}

fn tail_scan(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    let paragraphs: Vec<&str> = trimmed.split("\n\n").collect();
    if paragraphs.is_empty() {
        return Vec::new();
    }
    let last_content = if paragraphs.len() >= 2 {
        paragraphs[paragraphs.len() - 2..].join("\n\n")
    } else {
        paragraphs[paragraphs.len() - 1].to_string()
    };
    let section = last_chars(&last_content, 400);
    extract_ranking_from_section(section)
}

fn bullet_fallback(text: &str) -> Vec<String> {
    let section = last_chars(text, 500);
    let pattern = bullet_pattern();
    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();
    for caps in pattern.captures_iter(section) {
        let letter = caps[1].chars().next().unwrap().to_ascii_uppercase();
        if seen.insert(letter) {
            results.push(format!("Response {letter}"));
        }
    }
    if results.len() >= 2 {
        results
    } else {
        Vec::new()
    }
}

/// Parse the ranking an evaluator produced for one Stage 2 reply. Pure and
/// total: never panics, returns an empty `Vec` when nothing recognizable is
/// present.
pub fn parse_ranking_from_text(ranking_text: &str) -> Vec<String> {
    let header = explicit_header_scan(ranking_text);
    if !header.is_empty() {
        return header;
    }
    let tail = tail_scan(ranking_text);
    if !tail.is_empty() {
        return tail;
    }
    bullet_fallback(ranking_text)
}

/// One node's position across evaluators, used to compute the mean and vote
/// count for [`calculate_aggregate_rankings`].
#[derive(Debug, Clone)]
pub struct AggregateRanking {
    pub node_id: String,
    pub mean_position: f64,
    pub vote_count: usize,
}

/// Fold a set of per-evaluator rankings (already mapped from labels to node
/// ids) into mean-position aggregates, sorted ascending by mean, ties broken
/// by vote count desc then node id.
pub fn calculate_aggregate_rankings(rankings: &[Vec<String>]) -> Vec<AggregateRanking> {
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
    for ranking in rankings {
        for (idx, node_id) in ranking.iter().enumerate() {
            positions.entry(node_id.clone()).or_default().push(idx + 1);
        }
    }

    let mut aggregates: Vec<AggregateRanking> = positions
        .into_iter()
        .map(|(node_id, votes)| {
            let vote_count = votes.len();
            let mean_position = votes.iter().sum::<usize>() as f64 / vote_count as f64;
            AggregateRanking {
                node_id,
                mean_position,
                vote_count,
            }
        })
        .collect();

    aggregates.sort_by(|a, b| {
        a.mean_position
            .partial_cmp(&b.mean_position)
            .unwrap()
            .then_with(|| b.vote_count.cmp(&a.vote_count))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    aggregates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_header_with_consecutive_ranking() {
        let text = "FINAL RANKING:\n1. Response C\n2. Response A\n3. Response B";
        assert_eq!(
            parse_ranking_from_text(text),
            vec!["Response C", "Response A", "Response B"]
        );
    }

    #[test]
    fn gap_in_positions_is_rejected() {
        let text = "1. Response A\n3. Response C";
        assert!(parse_ranking_from_text(text).is_empty());
    }

    #[test]
    fn bullet_list_without_numbered_form() {
        let text = "- Response A\n- Response B";
        assert_eq!(parse_ranking_from_text(text), vec!["Response A", "Response B"]);
    }

    #[test]
    fn no_recognizable_ranking_returns_empty() {
        assert!(parse_ranking_from_text("I think they were all pretty good honestly.").is_empty());
    }

    #[test]
    fn parser_is_pure() {
        let text = "FINAL RANKING:\n1. Response A\n2. Response B";
        assert_eq!(parse_ranking_from_text(text), parse_ranking_from_text(text));
    }

    #[test]
    fn aggregate_correctness_with_tie() {
        let rankings = vec![
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            vec!["B".to_string(), "A".to_string(), "C".to_string()],
        ];
        let aggregates = calculate_aggregate_rankings(&rankings);
        let a = aggregates.iter().find(|r| r.node_id == "A").unwrap();
        let b = aggregates.iter().find(|r| r.node_id == "B").unwrap();
        let c = aggregates.iter().find(|r| r.node_id == "C").unwrap();
        assert!((a.mean_position - 1.5).abs() < 1e-9);
        assert!((b.mean_position - 1.5).abs() < 1e-9);
        assert!((c.mean_position - 3.0).abs() < 1e-9);
        // tiebreak by vote count desc then node id puts A before B when counts are equal.
        assert_eq!(aggregates[0].node_id, "A");
        assert_eq!(aggregates[1].node_id, "B");
    }

    #[test]
    fn tail_scan_used_when_no_header_present() {
        let text = "Some discussion.\n\nLooking at these closely:\n1. Response B\n2. Response A";
        assert_eq!(parse_ranking_from_text(text), vec!["Response B", "Response A"]);
    }
}
