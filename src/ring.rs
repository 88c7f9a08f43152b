/// Copy `dest.len()` samples out of a ring of `capacity` samples, starting at
/// `read_cursor`. When the span runs past the end of the ring it is fetched in
/// two reads, the tail `read_cursor..capacity` followed by the head `0..rest`,
/// so `dest` holds the samples in the order they were written.
///
/// `read` is the driver's non-wrapping buffer read primitive.
pub fn copy_wrapped<E, F>(
    read_cursor: usize,
    capacity: usize,
    dest: &mut [f64],
    mut read: F,
) -> Result<(), E>
where
    F: FnMut(usize, &mut [f64]) -> Result<(), E>,
{
    debug_assert!(read_cursor < capacity);
    debug_assert!(dest.len() <= capacity);

    if read_cursor + dest.len() > capacity {
        let first_len = capacity - read_cursor;
        let (first, second) = dest.split_at_mut(first_len);
        read(read_cursor, first)?;
        read(0, second)?;
    } else {
        read(read_cursor, dest)?;
    }
    Ok(())
}

/// Where the cursor lands after consuming `count` samples.
pub fn advance_cursor(read_cursor: usize, count: usize, capacity: usize) -> usize {
    (read_cursor + count) % capacity
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ring of `capacity` slots after `written` samples of the sequence 0, 1, 2, ...
    fn ring_after(capacity: usize, written: usize) -> Vec<f64> {
        let mut ring = vec![f64::NAN; capacity];
        for n in 0..written {
            ring[n % capacity] = n as f64;
        }
        ring
    }

    fn read_from(ring: &[f64]) -> impl FnMut(usize, &mut [f64]) -> Result<(), String> + '_ {
        move |start, dest| {
            let end = start + dest.len();
            if end > ring.len() {
                return Err(format!("read {start}..{end} past end"));
            }
            dest.copy_from_slice(&ring[start..end]);
            Ok(())
        }
    }

    #[test]
    fn test_contiguous_copy() {
        let ring = ring_after(100, 40);
        let mut dest = vec![0.0; 30];
        copy_wrapped(10, 100, &mut dest, read_from(&ring)).unwrap();
        let expected: Vec<f64> = (10..40).map(f64::from).collect();
        assert_eq!(dest, expected);
    }

    #[test]
    fn test_wrapped_copy_matches_linear_stream() {
        // 115 samples written into 100 slots: slots 85..100 hold 85..100, slots 0..15 hold 100..115
        let ring = ring_after(100, 115);
        let mut dest = vec![0.0; 30];
        let mut reads = Vec::new();
        copy_wrapped(85, 100, &mut dest, |start, chunk: &mut [f64]| {
            reads.push((start, chunk.len()));
            read_from(&ring)(start, chunk)
        })
        .unwrap();

        assert_eq!(reads, vec![(85, 15), (0, 15)]);
        let expected: Vec<f64> = (85..115).map(f64::from).collect();
        assert_eq!(dest, expected);
    }

    #[test]
    fn test_copy_ending_exactly_at_capacity_is_single_read() {
        let ring = ring_after(100, 100);
        let mut dest = vec![0.0; 30];
        let mut reads = 0;
        copy_wrapped(70, 100, &mut dest, |start, chunk: &mut [f64]| {
            reads += 1;
            read_from(&ring)(start, chunk)
        })
        .unwrap();
        assert_eq!(reads, 1);
        assert_eq!(dest[0], 70.0);
        assert_eq!(dest[29], 99.0);
    }

    #[test]
    fn test_read_error_propagates() {
        let mut dest = vec![0.0; 10];
        let result = copy_wrapped(95, 100, &mut dest, |start, _: &mut [f64]| {
            if start == 0 {
                Err("second half failed")
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err("second half failed"));
    }

    #[test]
    fn test_advance_cursor_wraps() {
        assert_eq!(advance_cursor(85, 30, 100), 15);
        assert_eq!(advance_cursor(70, 30, 100), 0);
        assert_eq!(advance_cursor(0, 30, 100), 30);
    }
}
