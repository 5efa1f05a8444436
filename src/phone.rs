//! Phone number normalization and matching.
//!
//! Numbers are compared from their least-significant digit backward, so
//! that the same subscriber reached through different prefixes
//! ("+358470009955" vs "0470009955") still matches. A DTMF dial-string
//! suffix (p/w/x/#/* and what follows) is skipped during the main
//! comparison and only consulted once the digit match is good enough.

/// Sentinel match length reported when two numbers match completely.
pub const EXACT_MATCH: usize = 100;

/// Significant trailing characters retained by the minimized form, and the
/// minimum digit-match length required before a DTMF suffix is compared.
pub const MINIMIZED_NUMBER_LENGTH: usize = 7;

fn is_dtmf_char(c: char) -> bool {
    matches!(c, 'p' | 'P' | 'w' | 'W' | 'x' | 'X' | '#' | '*')
}

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '-' | '.' | '(' | ')' | '/')
}

/// Normalize a dialable number: strip visual separators, keep a leading
/// '+', keep the DTMF dial-string suffix verbatim. Returns `None` when the
/// input is not a valid phone number.
pub fn normalize_phone_number(input: &str) -> Option<String> {
    let mut normalized = String::with_capacity(input.len());
    let mut in_dial_string = false;
    let mut digits = 0usize;

    for (i, c) in input.trim().chars().enumerate() {
        if in_dial_string {
            // Dial-string suffix is preserved as-is, apart from separators
            if !is_separator(c) {
                normalized.push(c);
            }
        } else if c == '+' {
            if i != 0 {
                return None;
            }
            normalized.push(c);
        } else if c.is_ascii_digit() {
            digits += 1;
            normalized.push(c);
        } else if is_dtmf_char(c) {
            in_dial_string = true;
            normalized.push(c);
        } else if !is_separator(c) {
            return None;
        }
    }

    if digits == 0 {
        return None;
    }

    Some(normalized)
}

/// Minimized comparable form: normalized, dial string and '+' removed,
/// truncated to the trailing `MINIMIZED_NUMBER_LENGTH` characters.
pub fn minimize_phone_number(input: &str) -> Option<String> {
    let normalized = normalize_phone_number(input)?;

    let digits: String = normalized
        .chars()
        .take_while(|c| !is_dtmf_char(*c))
        .filter(|c| *c != '+')
        .collect();

    let skip = digits.len().saturating_sub(MINIMIZED_NUMBER_LENGTH);
    Some(digits.chars().skip(skip).collect())
}

fn first_dtmf_index(chars: &[char]) -> usize {
    chars
        .iter()
        .position(|c| is_dtmf_char(*c))
        .unwrap_or(chars.len())
}

/// Length of the trailing match between two normalized numbers.
///
/// Returns `EXACT_MATCH` when every digit matches back to both numbers'
/// start. Otherwise counts trailing matching digits, extending through the
/// DTMF suffix once all of one number has matched or the count reaches
/// `MINIMIZED_NUMBER_LENGTH`.
pub fn match_length(lhs: &str, rhs: &str) -> usize {
    if lhs.is_empty() || rhs.is_empty() {
        return 0;
    }

    let l: Vec<char> = lhs.chars().collect();
    let r: Vec<char> = rhs.chars().collect();

    let ldtmf = first_dtmf_index(&l);
    let rdtmf = first_dtmf_index(&r);

    let mut process_dtmf = false;
    let mut matched = 0usize;

    if ldtmf != 0 && rdtmf != 0 {
        // Walk backward from the last non-DTMF digit of each number
        let mut li = ldtmf - 1;
        let mut ri = rdtmf - 1;

        while l[li] == r[ri] {
            matched += 1;

            if li == 0 && ri == 0 {
                // Complete, exact match - this must be the best match
                return EXACT_MATCH;
            }
            if li == 0 || ri == 0 {
                // Matched all of one number - continue in the DTMF part
                process_dtmf = true;
                break;
            }

            li -= 1;
            ri -= 1;

            if li == 0 || ri == 0 {
                if l[li] == r[ri] {
                    matched += 1;
                    if li == 0 && ri == 0 {
                        return EXACT_MATCH;
                    }
                    process_dtmf = true;
                }
                break;
            }
        }
    } else {
        // One number is nothing but dial string
        process_dtmf = true;
    }

    if matched >= MINIMIZED_NUMBER_LENGTH || process_dtmf {
        // See if the match continues into the DTMF area
        let mut li = ldtmf;
        let mut ri = rdtmf;
        while li < l.len() && ri < r.len() {
            if !l[li].eq_ignore_ascii_case(&r[ri]) {
                break;
            }
            matched += 1;
            li += 1;
            ri += 1;
        }
    }

    matched
}

/// Best match length over all of a contact's numbers, each compared in
/// normalized form against `target`.
pub fn best_number_match_length<'a, I>(numbers: I, target: &str) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best = 0;
    for number in numbers {
        if let Some(normalized) = normalize_phone_number(number) {
            best = best.max(match_length(&normalized, target));
            if best == EXACT_MATCH {
                return EXACT_MATCH;
            }
        }
    }
    best
}
