//! Process-global register of refcounted public objects.
//!
//! Language bindings address fabric objects through integer handles; the
//! register maps those onto strong references. The single lock is held only
//! for short lookups. Destroying an object that other parties still hold a
//! strong reference to is refused rather than deferred.

use crate::errors::{ErrorCode, Result};

use hashbrown::HashMap;
use lazy_static::lazy_static;

use std::any::Any;
use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    #[inline]
    pub fn number(self) -> u32 {
        self.0
    }
}

struct Register {
    entries: HashMap<u32, Arc<dyn Any + Send + Sync>>,
    next: u32,
}

lazy_static! {
    static ref REGISTER: Mutex<Option<Register>> = Mutex::new(None);
}

pub fn initialise() -> Result<()> {
    let mut register = REGISTER.lock().unwrap();
    if register.is_some() {
        return Err(ErrorCode::AlreadyInitialised);
    }

    *register = Some(Register {
        entries: HashMap::new(),
        next: 1,
    });
    Ok(())
}

/// Drops every live handle and closes the register.
pub fn shutdown() -> Result<()> {
    let mut register = REGISTER.lock().unwrap();
    if register.take().is_none() {
        return Err(ErrorCode::NotInitialised);
    }
    Ok(())
}

pub fn register<T: Any + Send + Sync>(object: Arc<T>) -> Result<Handle> {
    let mut guard = REGISTER.lock().unwrap();
    let register = guard.as_mut().ok_or(ErrorCode::NotInitialised)?;

    let number = register.next;
    register.next += 1;
    register.entries.insert(number, object);

    Ok(Handle(number))
}

pub fn get<T: Any + Send + Sync>(handle: Handle) -> Result<Arc<T>> {
    let guard = REGISTER.lock().unwrap();
    let register = guard.as_ref().ok_or(ErrorCode::NotInitialised)?;

    let object = register.entries.get(&handle.0).ok_or(ErrorCode::InvalidHandle)?;
    object.clone().downcast::<T>().map_err(|_| ErrorCode::WrongObjectType)
}

/// Removes the handle and drops the register's reference. Fails with
/// `ObjectStillUsed` while other strong references exist; the handle stays
/// valid in that case.
pub fn destroy(handle: Handle) -> Result<()> {
    let mut guard = REGISTER.lock().unwrap();
    let register = guard.as_mut().ok_or(ErrorCode::NotInitialised)?;

    let object = register.entries.remove(&handle.0).ok_or(ErrorCode::InvalidHandle)?;
    if Arc::strong_count(&object) > 1 {
        register.entries.insert(handle.0, object);
        return Err(ErrorCode::ObjectStillUsed);
    }

    Ok(())
}
