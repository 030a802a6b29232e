//! Argument sequences for [`Controller::map`](crate::controller::Controller::map).
//!
//! `map` accepts zero or more sequences and zips them positionally: task `i`
//! receives the `i`-th element of every sequence, and the shortest sequence
//! decides how many tasks run. Passing `()` means "no sequences", which `map`
//! answers with `None` instead of running anything.

use std::vec;

/// Something `map` can draw task arguments from.
pub trait Sequences {
    /// The argument handed to one task.
    type Item: Send + 'static;

    /// Iterates over the arguments, one per task.
    type Iter: Iterator<Item = Self::Item>;

    /// Returns the arguments, or `None` when no sequence was given.
    fn into_tuples(self) -> Option<Self::Iter>;
}

impl Sequences for () {
    type Item = ();
    type Iter = vec::IntoIter<()>;

    fn into_tuples(self) -> Option<Self::Iter> {
        None
    }
}

/// A single sequence. Each task receives one element, unwrapped.
impl<A> Sequences for Vec<A>
where
    A: Send + 'static,
{
    type Item = A;
    type Iter = vec::IntoIter<A>;

    fn into_tuples(self) -> Option<Self::Iter> {
        Some(self.into_iter())
    }
}

/// Walks several iterators in lockstep and stops at the first one to run dry.
#[derive(Debug, Clone)]
pub struct Zip<T> {
    iters: T,
}

macro_rules! zip_sequences {
    ($($seq:ident $iter:ident),+) => {
        impl<$($seq),+> Sequences for ($($seq,)+)
        where
            $($seq: IntoIterator, $seq::Item: Send + 'static,)+
        {
            type Item = ($($seq::Item,)+);
            type Iter = Zip<($($seq::IntoIter,)+)>;

            fn into_tuples(self) -> Option<Self::Iter> {
                let ($($iter,)+) = self;
                Some(Zip {
                    iters: ($($iter.into_iter(),)+),
                })
            }
        }

        impl<$($seq),+> Iterator for Zip<($($seq,)+)>
        where
            $($seq: Iterator,)+
        {
            type Item = ($($seq::Item,)+);

            fn next(&mut self) -> Option<Self::Item> {
                let ($($iter,)+) = &mut self.iters;
                Some(($($iter.next()?,)+))
            }
        }
    };
}

zip_sequences!(A a);
zip_sequences!(A a, B b);
zip_sequences!(A a, B b, C c);
zip_sequences!(A a, B b, C c, D d);

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<S: Sequences>(sequences: S) -> Option<Vec<S::Item>> {
        sequences.into_tuples().map(Iterator::collect)
    }

    #[test]
    fn no_sequences() {
        assert_eq!(collect(()), None);
    }

    #[test]
    fn single_vec_is_unwrapped() {
        assert_eq!(collect(vec![1, 2, 3]), Some(vec![1, 2, 3]));
    }

    #[test]
    fn shortest_sequence_wins() {
        assert_eq!(
            collect((vec![1, 2, 3], vec!['a', 'b'])),
            Some(vec![(1, 'a'), (2, 'b')])
        );
        assert_eq!(
            collect((0..10, vec!["x"; 4], 5..7, vec![true; 9])),
            Some(vec![(0, "x", 5, true), (1, "x", 6, true)])
        );
    }

    #[test]
    fn empty_sequence_yields_nothing() {
        assert_eq!(collect((Vec::<u8>::new(),)), Some(vec![]));
        assert_eq!(collect((0..3, Vec::<u8>::new())), Some(vec![]));
    }
}
