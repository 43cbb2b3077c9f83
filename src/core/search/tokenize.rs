// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Query and document tokenization for the search index.

/// Minimum keyword length; shorter tokens are dropped.
pub const MIN_KEYWORD_LEN: usize = 2;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "with",
];

/// Lowercase, strip punctuation, drop stop words and short tokens.
/// Returns unique terms in first-seen order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        let term = raw.to_lowercase();
        if term.len() < MIN_KEYWORD_LEN {
            continue;
        }
        if STOP_WORDS.binary_search(&term.as_str()).is_ok() {
            continue;
        }
        if !out.contains(&term) {
            out.push(term);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_strips_and_dedupes() {
        assert_eq!(
            tokenize("The Quick, quick brown FOX is on a log!"),
            vec!["quick", "brown", "fox", "log"]
        );
    }

    #[test]
    fn drops_short_and_stop_words() {
        assert!(tokenize("a I to of the").is_empty());
        assert_eq!(tokenize("db io x"), vec!["db", "io"]);
    }

    #[test]
    fn stop_words_are_sorted_for_binary_search() {
        let mut sorted = STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOP_WORDS);
    }
}
