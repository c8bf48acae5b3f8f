//! Long-text segmentation into model-sized chunks.
//!
//! Text is cut at the coarsest boundary that lets every chunk fit the
//! acoustic model's token limit: sentences, then clauses, then whitespace,
//! each first tried without breaking quoted spans. Grapheme boundaries are
//! the last resort for unspaced scripts.

use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

/// Token count reported for text the front-end cannot tokenize.
pub const UNTOKENIZABLE: usize = usize::MAX;

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentationError {
    #[error("Chunk capacity must be at least one token")]
    ZeroCapacity,
    #[error("Text at bytes {start}..{end} needs {tokens} tokens, over the chunk limit of {limit}")]
    Oversized {
        start: usize,
        end: usize,
        tokens: usize,
        limit: usize,
    },
}

/// A span of the original text synthesized as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    index: usize,
    span: Range<usize>,
    text: String,
}

impl TextChunk {
    pub fn new(index: usize, span: Range<usize>, text: impl Into<String>) -> Self {
        Self {
            index,
            span,
            text: text.into(),
        }
    }

    /// 1-based position in the original text.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte range in the original text, surrounding whitespace included.
    pub fn span(&self) -> Range<usize> {
        self.span.clone()
    }

    /// Text to synthesize: the span without surrounding whitespace.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source<'a>(&self, original: &'a str) -> &'a str {
        &original[self.span.clone()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Sentence,
    Clause,
    Whitespace,
    Grapheme,
}

/// Boundaries from coarsest to finest. Quoted spans are kept whole on the
/// first pass through the punctuation and whitespace levels.
const LADDER: [(Boundary, bool); 7] = [
    (Boundary::Sentence, true),
    (Boundary::Clause, true),
    (Boundary::Whitespace, true),
    (Boundary::Sentence, false),
    (Boundary::Clause, false),
    (Boundary::Whitespace, false),
    (Boundary::Grapheme, false),
];

fn is_sentence_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…' | '‼' | '⁇')
}

fn is_clause_separator(c: char) -> bool {
    matches!(c, ',' | ';' | ':' | '、' | '，' | '；' | '：' | '—' | '・')
}

fn closing_pair(c: char) -> Option<char> {
    match c {
        '「' => Some('」'),
        '『' => Some('』'),
        '(' => Some(')'),
        '（' => Some('）'),
        '“' => Some('”'),
        '‘' => Some('’'),
        '[' => Some(']'),
        '【' => Some('】'),
        _ => None,
    }
}

fn is_closer(c: char) -> bool {
    matches!(c, '」' | '』' | ')' | '）' | '”' | '’' | ']' | '】' | '"' | '\'')
}

/// Tracks whether the scan position is inside a quoted or bracketed span.
#[derive(Default)]
struct QuoteState {
    stack: Vec<char>,
    in_ascii_quote: bool,
}

impl QuoteState {
    fn feed(&mut self, c: char) {
        if c == '"' {
            self.in_ascii_quote = !self.in_ascii_quote;
        } else if let Some(close) = closing_pair(c) {
            self.stack.push(close);
        } else if self.stack.last() == Some(&c) {
            self.stack.pop();
        }
    }

    fn is_open(&self) -> bool {
        self.in_ascii_quote || !self.stack.is_empty()
    }
}

/// Split offsets (relative to `text`, never 0) for one boundary kind.
fn split_points(text: &str, boundary: Boundary, respect_quotes: bool) -> Vec<usize> {
    let mut points: Vec<usize> = Vec::new();
    let push = |points: &mut Vec<usize>, at: usize| {
        if at > 0 && at < text.len() && points.last().map_or(true, |&last| at > last) {
            points.push(at);
        }
    };

    match boundary {
        Boundary::Grapheme => {
            for (i, _) in text.grapheme_indices(true) {
                push(&mut points, i);
            }
        }
        Boundary::Whitespace => {
            let mut quotes = QuoteState::default();
            let mut scanned = 0;
            for run in WHITESPACE_RUN.find_iter(text) {
                text[scanned..run.start()].chars().for_each(|c| quotes.feed(c));
                scanned = run.start();
                if !respect_quotes || !quotes.is_open() {
                    push(&mut points, run.start());
                }
            }
        }
        Boundary::Sentence | Boundary::Clause => {
            let is_terminal = |c: char| match boundary {
                Boundary::Sentence => is_sentence_terminator(c),
                _ => is_clause_separator(c),
            };
            let mut quotes = QuoteState::default();
            // Set after a terminal run: (outside any quote, run has a
            // full-width terminal).
            let mut after_terminal: Option<(bool, bool)> = None;

            for (i, c) in text.char_indices() {
                if let Some((at_top, full_width)) = after_terminal.as_mut() {
                    if is_terminal(c) || is_closer(c) {
                        *full_width |= is_terminal(c) && !c.is_ascii();
                        quotes.feed(c);
                        continue;
                    }
                    // ASCII punctuation needs whitespace after it, so "3.14"
                    // and "1,000" stay whole. Full-width punctuation splits
                    // directly, unless it sat inside a quote ("「待て。」と").
                    let balanced = !respect_quotes || !quotes.is_open();
                    if balanced && (c.is_whitespace() || (*at_top && *full_width)) {
                        push(&mut points, i);
                    }
                    after_terminal = None;
                }

                if boundary == Boundary::Sentence && c == '\n' && (!respect_quotes || !quotes.is_open()) {
                    // "\r\n" is one grapheme.
                    let at = if text[..i].ends_with('\r') { i - 1 } else { i };
                    push(&mut points, at);
                }

                if is_terminal(c) {
                    after_terminal = Some((!respect_quotes || !quotes.is_open(), !c.is_ascii()));
                }
                quotes.feed(c);
            }
        }
    }

    points
}

fn to_ranges(base: usize, len: usize, points: &[usize]) -> Vec<Range<usize>> {
    let mut ranges = Vec::with_capacity(points.len() + 1);
    let mut start = 0;
    for &point in points {
        ranges.push(base + start..base + point);
        start = point;
    }
    ranges.push(base + start..base + len);
    ranges
}

/// Splits text into chunks that fit the acoustic model's token capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmenter {
    max_tokens: usize,
}

impl Segmenter {
    pub fn new(max_tokens_per_chunk: usize) -> Self {
        Self {
            max_tokens: max_tokens_per_chunk,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Segment `text`, measuring candidate chunks with `count_tokens`.
    ///
    /// Chunk spans are contiguous and cover the whole input, so concatenating
    /// them reproduces `text` exactly. Empty or whitespace-only input yields
    /// no chunks.
    ///
    /// A count of [`UNTOKENIZABLE`] never fits. Such text is split down to
    /// single graphemes, and each grapheme that still cannot be measured
    /// becomes a chunk of its own.
    pub fn segment<F>(&self, text: &str, count_tokens: F) -> Result<Vec<TextChunk>, SegmentationError>
    where
        F: Fn(&str) -> usize,
    {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.max_tokens == 0 {
            return Err(SegmentationError::ZeroCapacity);
        }

        let mut spans = Vec::new();
        self.split(text, 0..text.len(), 0, &count_tokens, &mut spans)?;

        // Fold whitespace-only spans into a neighbour: leading ones into the
        // first real chunk, the rest into the chunk before them.
        let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
        let mut leading: Option<usize> = None;
        for span in spans {
            if text[span.clone()].trim().is_empty() {
                match merged.last_mut() {
                    Some(last) => last.end = span.end,
                    None => leading = Some(leading.unwrap_or(span.start)),
                }
            } else {
                let start = leading.take().unwrap_or(span.start);
                merged.push(start..span.end);
            }
        }

        Ok(merged
            .into_iter()
            .enumerate()
            .map(|(i, span)| {
                let trimmed = text[span.clone()].trim().to_string();
                TextChunk::new(i + 1, span, trimmed)
            })
            .collect())
    }

    fn fits<F: Fn(&str) -> usize>(&self, text: &str, span: &Range<usize>, count_tokens: &F) -> bool {
        count_tokens(text[span.clone()].trim()) <= self.max_tokens
    }

    fn split<F: Fn(&str) -> usize>(
        &self,
        text: &str,
        span: Range<usize>,
        level: usize,
        count_tokens: &F,
        out: &mut Vec<Range<usize>>,
    ) -> Result<(), SegmentationError> {
        if self.fits(text, &span, count_tokens) {
            out.push(span);
            return Ok(());
        }

        let Some(&(boundary, respect_quotes)) = LADDER.get(level) else {
            let tokens = count_tokens(text[span.clone()].trim());
            if tokens == UNTOKENIZABLE {
                // Isolated so synthesis reports it against its own chunk.
                out.push(span);
                return Ok(());
            }
            return Err(SegmentationError::Oversized {
                start: span.start,
                end: span.end,
                tokens,
                limit: self.max_tokens,
            });
        };

        let slice = &text[span.clone()];
        let points = split_points(slice, boundary, respect_quotes);
        if points.is_empty() {
            return self.split(text, span, level + 1, count_tokens, out);
        }

        // Greedy packing: grow the current chunk while it still fits,
        // recurse into any single piece that is too large on its own.
        let mut current: Option<Range<usize>> = None;
        for piece in to_ranges(span.start, slice.len(), &points) {
            if let Some(open) = current.take() {
                let candidate = open.start..piece.end;
                if self.fits(text, &candidate, count_tokens) {
                    current = Some(candidate);
                    continue;
                }
                out.push(open);
            }

            if self.fits(text, &piece, count_tokens) {
                current = Some(piece);
            } else {
                self.split(text, piece, level + 1, count_tokens, out)?;
            }
        }
        if let Some(open) = current {
            out.push(open);
        }

        Ok(())
    }
}
