/// Runs a closure when dropped, on every exit path of the owning scope.
pub struct ScopeGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn early_return(hits: &Cell<u32>, bail: bool) -> u32 {
        let _guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
        if bail {
            return 0;
        }
        1
    }

    #[test]
    fn runs_on_every_exit_path() {
        let hits = Cell::new(0);
        early_return(&hits, true);
        early_return(&hits, false);
        assert_eq!(hits.get(), 2);
    }
}
