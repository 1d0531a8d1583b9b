use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// Shared single-threaded handle to state that lives on the main event loop.
///
/// Everything that touches the reconciler or the storage health state runs on one
/// `LocalSet`, so a `RefCell` is enough. Borrows must never be held across an `.await`.
#[derive(Default, Debug)]
pub struct WrappedRcRefCell<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    #[inline]
    pub fn wrap(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(value)),
        }
    }

    #[inline]
    #[track_caller]
    pub fn get(&self) -> Ref<'_, T> {
        self.inner.borrow()
    }

    #[inline]
    #[track_caller]
    pub fn get_mut(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}

impl<T> Clone for WrappedRcRefCell<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Create a newtype that will contain a type wrapped inside [`WrappedRcRefCell`].
#[macro_export]
macro_rules! define_wrapped_type {
    ($name: ident, $type: ty $(, $visibility: vis)?) => {
        #[derive(::std::clone::Clone)]
        #[repr(transparent)]
        $($visibility)* struct $name($crate::common::WrappedRcRefCell<$type>);

        impl ::std::ops::Deref for $name {
            type Target = $crate::common::WrappedRcRefCell<$type>;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}
