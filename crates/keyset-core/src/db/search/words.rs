use std::collections::BTreeSet;

///
/// WordMiddleware
///
/// One step of the word pipeline. Receives the words produced so far and
/// returns the words to pass on.
///

pub trait WordMiddleware: Send + Sync {
    fn process(&self, words: Vec<String>) -> Vec<String>;
}

impl<F> WordMiddleware for F
where
    F: Fn(Vec<String>) -> Vec<String> + Send + Sync,
{
    fn process(&self, words: Vec<String>) -> Vec<String> {
        self(words)
    }
}

///
/// Lowercase
///

#[derive(Clone, Copy, Debug, Default)]
pub struct Lowercase;

impl WordMiddleware for Lowercase {
    fn process(&self, words: Vec<String>) -> Vec<String> {
        words.into_iter().map(|word| word.to_lowercase()).collect()
    }
}

///
/// MinLength
/// Drops words shorter than the given number of characters.
///

#[derive(Clone, Copy, Debug)]
pub struct MinLength(pub usize);

impl WordMiddleware for MinLength {
    fn process(&self, words: Vec<String>) -> Vec<String> {
        words
            .into_iter()
            .filter(|word| word.chars().count() >= self.0)
            .collect()
    }
}

///
/// StopWords
///

#[derive(Clone, Debug, Default)]
pub struct StopWords {
    words: BTreeSet<String>,
}

impl StopWords {
    #[must_use]
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl WordMiddleware for StopWords {
    fn process(&self, words: Vec<String>) -> Vec<String> {
        words
            .into_iter()
            .filter(|word| !self.words.contains(word))
            .collect()
    }
}

/// Split text on anything that is not a letter or digit.
pub(crate) fn split_text(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}
