use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

const DEFAULT_LETTERS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DEFAULT_NUMBERS: &str = "0123456789";
const DEFAULT_SYMBOLS: &str = "~!@#$%^&*()_+`-={}|[]\\:\"<>?,./";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterClass {
    Letters,
    Numbers,
    Symbols,
}

impl fmt::Display for CharacterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CharacterClass::Letters => "letters",
            CharacterClass::Numbers => "numbers",
            CharacterClass::Symbols => "symbols",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("numbers plus symbols must be less than total length")]
    LengthExceeded,

    #[error("the list of allowed {0} must be specified")]
    AlphabetRequired(CharacterClass),

    #[error("Randomness source failed: {0}")]
    Randomness(#[from] rand::Error),
}

/// Generates a password of `length` characters containing exactly
/// `numbers_count` numbers and `symbols_count` symbols, the rest letters.
///
/// Every character is drawn from its class alphabet and inserted at a random
/// position of the password built so far, so classes are interleaved rather
/// than laid out in fixed slots. `None` selects the default alphabet.
pub fn generate_password(
    length: usize,
    numbers_count: usize,
    symbols_count: usize,
    letters: Option<&str>,
    numbers: Option<&str>,
    symbols: Option<&str>,
) -> Result<String, Error> {
    let letters: Vec<char> = letters.unwrap_or(DEFAULT_LETTERS).chars().collect();
    let numbers: Vec<char> = numbers.unwrap_or(DEFAULT_NUMBERS).chars().collect();
    let symbols: Vec<char> = symbols.unwrap_or(DEFAULT_SYMBOLS).chars().collect();

    if numbers_count > 0 && numbers.is_empty() {
        return Err(Error::AlphabetRequired(CharacterClass::Numbers));
    }
    if symbols_count > 0 && symbols.is_empty() {
        return Err(Error::AlphabetRequired(CharacterClass::Symbols));
    }

    let letters_count = length
        .checked_sub(numbers_count)
        .and_then(|rest| rest.checked_sub(symbols_count))
        .ok_or(Error::LengthExceeded)?;

    if letters_count > 0 && letters.is_empty() {
        return Err(Error::AlphabetRequired(CharacterClass::Letters));
    }

    let mut password: Vec<char> = Vec::with_capacity(length);
    scramble(&mut password, &letters, letters_count)?;
    scramble(&mut password, &numbers, numbers_count)?;
    scramble(&mut password, &symbols, symbols_count)?;

    return Ok(password.into_iter().collect());
}

fn scramble(password: &mut Vec<char>, allowed: &[char], count: usize) -> Result<(), Error> {
    for _ in 0..count {
        let selection = allowed[random_index(allowed.len())?];
        let position = random_index(password.len() + 1)?;
        password.insert(position, selection);
    }

    return Ok(());
}

/// Uniform index in `0..upper`, rejecting draws from the biased tail.
fn random_index(upper: usize) -> Result<usize, Error> {
    if upper <= 1 {
        return Ok(0);
    }

    let upper = upper as u64;
    let zone = u64::MAX - (u64::MAX % upper);
    let mut buffer = [0u8; 8];
    loop {
        OsRng.try_fill_bytes(&mut buffer)?;
        let candidate = u64::from_le_bytes(buffer);
        if candidate < zone {
            return Ok((candidate % upper) as usize);
        }
    }
}
