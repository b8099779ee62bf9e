use liblzma::write::XzEncoder;
use std::fmt::Display;
use std::io::{Error, Write};

pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for XzEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

/// A sink that can be told its stream will never be completed.
pub trait Abort {
    fn abort(&mut self, reason: &dyn Display);
}

impl<A: Abort + ?Sized> Abort for &mut A {
    fn abort(&mut self, reason: &dyn Display) {
        (**self).abort(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct TestFinisher {
        inner: Cursor<Vec<u8>>,
        should_fail: bool,
    }

    impl Finish<Cursor<Vec<u8>>> for TestFinisher {
        fn finish(self) -> Result<Cursor<Vec<u8>>, Error> {
            if self.should_fail {
                Err(Error::other("Test failure"))
            } else {
                Ok(self.inner)
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        reasons: Vec<String>,
    }

    impl Abort for RecordingSink {
        fn abort(&mut self, reason: &dyn Display) {
            self.reasons.push(reason.to_string());
        }
    }

    #[test]
    fn test_finish_trait_success() {
        let finisher = TestFinisher {
            inner: Cursor::new(vec![1, 2, 3]),
            should_fail: false,
        };

        let returned_cursor = finisher.finish().unwrap();
        assert_eq!(returned_cursor.get_ref(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_finish_trait_failure() {
        let finisher = TestFinisher {
            inner: Cursor::new(vec![1, 2, 3]),
            should_fail: true,
        };

        let error = finisher.finish().unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::Other);
        assert_eq!(error.to_string(), "Test failure");
    }

    #[test]
    fn test_xz_encoder_finish_impl() {
        let encoder = XzEncoder::new(Cursor::new(Vec::new()), 1);
        let cursor = Finish::finish(encoder).unwrap();
        assert!(!cursor.get_ref().is_empty());
    }

    #[test]
    fn test_abort_through_mut_ref() {
        fn abort_owned<A: Abort>(mut sink: A) {
            sink.abort(&"first");
        }

        let mut sink = RecordingSink::default();
        abort_owned(&mut sink);
        sink.abort(&42);
        assert_eq!(sink.reasons, vec!["first", "42"]);
    }
}
