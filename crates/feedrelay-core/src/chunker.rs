//! Splitting oversized outbound text into transport-legal parts
//!
//! Lengths are measured in `char`s. Paragraph breaks (`\n\n`) are preferred
//! split points, then line breaks, then a hard split. Separators that fall on
//! a part boundary are dropped; nothing else is.

/// Hard cap most chat transports enforce on one message.
pub const TRANSPORT_HARD_LIMIT: usize = 4096;

/// Default chunk size, leaving headroom below [`TRANSPORT_HARD_LIMIT`].
pub const DEFAULT_MAX_LEN: usize = 4000;

const PARAGRAPH: &str = "\n\n";
const LINE: &str = "\n";

/// Marker prefixed to every part after the first.
pub fn part_marker(index: usize, total: usize) -> String {
    format!("Part {}/{}\n\n", index, total)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

struct Atom<'a> {
    text: &'a str,
    /// Separator placed before this atom when it shares a part with the previous one.
    sep: &'static str,
}

/// Split `text` into parts of at most `max_len` chars each.
///
/// Text that already fits comes back unchanged as a single part. When more
/// than one part results, parts 2..N start with [`part_marker`]; room for the
/// marker is reserved out of the payload budget up front, so the marker is
/// never truncated and no payload is lost making room for it. If `max_len`
/// is too small to hold a marker at all, the parts are returned unmarked.
pub fn split(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 {
        return Vec::new();
    }
    if char_len(text) <= max_len {
        return vec![text.to_string()];
    }

    // Start by assuming a single-digit part count and widen until the
    // reserved marker room covers the marker the final count needs.
    let mut reserve = char_len(&part_marker(9, 9));
    loop {
        if reserve >= max_len {
            return pack(text, max_len, max_len);
        }

        let payloads = pack(text, max_len, max_len - reserve);
        let total = payloads.len();
        let needed = char_len(&part_marker(total, total));
        if needed <= reserve {
            return payloads
                .into_iter()
                .enumerate()
                .map(|(i, payload)| {
                    if i == 0 {
                        payload
                    } else {
                        let mut part = part_marker(i + 1, total);
                        part.push_str(&payload);
                        part
                    }
                })
                .collect();
        }
        reserve = needed;
    }
}

/// Greedy accumulation. The first part may use `first_budget`, later parts
/// `rest_budget`; every atom is cut to fit `rest_budget`.
fn pack(text: &str, first_budget: usize, rest_budget: usize) -> Vec<String> {
    let atoms = atomize(text, rest_budget);

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for atom in atoms {
        let atom_len = char_len(atom.text);
        if current_len == 0 {
            // separators and empty atoms at a part boundary carry no content
            if atom_len == 0 {
                continue;
            }
            current.push_str(atom.text);
            current_len = atom_len;
            continue;
        }

        let budget = if parts.is_empty() { first_budget } else { rest_budget };
        let joined = current_len + char_len(atom.sep) + atom_len;
        if joined <= budget {
            current.push_str(atom.sep);
            current.push_str(atom.text);
            current_len = joined;
        } else {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
            if atom_len > 0 {
                current.push_str(atom.text);
                current_len = atom_len;
            }
        }
    }

    if current_len > 0 {
        parts.push(current);
    }
    parts
}

fn atomize(text: &str, budget: usize) -> Vec<Atom<'_>> {
    let mut atoms = Vec::new();

    for (pi, paragraph) in text.split(PARAGRAPH).enumerate() {
        let para_sep = if pi == 0 { "" } else { PARAGRAPH };

        if char_len(paragraph) <= budget {
            atoms.push(Atom { text: paragraph, sep: para_sep });
            continue;
        }

        for (li, line) in paragraph.split(LINE).enumerate() {
            let line_sep = if li == 0 { para_sep } else { LINE };

            if char_len(line) <= budget {
                atoms.push(Atom { text: line, sep: line_sep });
                continue;
            }

            let mut rest = line;
            let mut sep = line_sep;
            while !rest.is_empty() {
                let cut = rest
                    .char_indices()
                    .nth(budget)
                    .map(|(idx, _)| idx)
                    .unwrap_or(rest.len());
                atoms.push(Atom { text: &rest[..cut], sep });
                rest = &rest[cut..];
                sep = "";
            }
        }
    }

    atoms
}
