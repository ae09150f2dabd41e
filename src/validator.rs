/// Decides whether a record located by the perfect hash belongs to the
/// requested key.
///
/// A minimal perfect hash maps unknown keys to arbitrary buckets, so readers
/// pass the record they found through a validator before surfacing it.
/// `extracted_key` is `None` for tables that do not store keys. Returning
/// `None` reports the key as missing; returning `Some` surfaces the (possibly
/// rewritten) value.
///
/// Readers instantiate `V` as `Option<Value>` so that valueless tables can
/// still accept a record.
pub trait KeyValidator<K, V>: Send + Sync {
    fn validate(&self, input: &K, extracted_key: Option<&K>, extracted_value: V) -> Option<V>;
}

/// Accepts a record when its stored key equals the requested key, or when
/// the table does not store keys at all.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EqualKeyValidator;

impl<K: PartialEq, V> KeyValidator<K, V> for EqualKeyValidator {
    fn validate(&self, input: &K, extracted_key: Option<&K>, extracted_value: V) -> Option<V> {
        match extracted_key {
            Some(key) if key != input => None,
            _ => Some(extracted_value),
        }
    }
}
