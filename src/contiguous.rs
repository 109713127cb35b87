/// Splits `items` into its longest leading contiguous run and the rest.
///
/// Items are ordered by `key`; the run starts at the smallest key and is
/// extended while `key(next) == key(cur) + step(cur)`. Both halves come
/// back sorted by key.
///
/// The two receiver call sites compose this differently: the cumulative-ACK
/// path discards the run but re-inserts its last element as the anchor the
/// next run grows from, while the delivery path consumes the run and keeps
/// the rest buffered.
pub fn longest_run<T, K, S>(mut items: Vec<T>, key: K, step: S) -> (Vec<T>, Vec<T>)
where
    K: Fn(&T) -> u32,
    S: Fn(&T) -> u32,
{
    if items.is_empty() {
        return (Vec::new(), Vec::new());
    }

    items.sort_by_key(|item| key(item));

    let mut split = 1;
    while split < items.len() {
        let prev = &items[split - 1];
        if key(&items[split]) == key(prev) + step(prev) {
            split += 1;
        } else {
            break;
        }
    }

    let rest = items.split_off(split);
    (items, rest)
}
