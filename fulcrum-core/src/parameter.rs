//! Typed, atomically-readable parameter cells.
//!
//! Grounded on the teacher's `PerfMetrics` (`perf.rs`): a struct of plain
//! `AtomicU64` counters read and written without any outer lock. A
//! `Parameter` generalizes that one step further — the bit width and
//! signedness vary per declaration, so the value is stored as a 64-bit
//! pattern behind one `AtomicI64` and reinterpreted through `ParameterType`
//! on every read/write.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{FulcrumError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl ParameterType {
    fn truncate(self, value: i64) -> i64 {
        match self {
            ParameterType::U8 => value as u8 as i64,
            ParameterType::U16 => value as u16 as i64,
            ParameterType::U32 => value as u32 as i64,
            ParameterType::U64 => value as u64 as i64,
            ParameterType::I8 => value as i8 as i64,
            ParameterType::I16 => value as i16 as i64,
            ParameterType::I32 => value as i32 as i64,
            ParameterType::I64 => value,
        }
    }
}

/// Ordering here is load-bearing: derived `PartialOrd`/`Ord` walk variants in
/// declaration order, so `Public < Dependency < Private` holds exactly as
/// the data model requires (numerically smaller = more open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessGroup {
    Public,
    Dependency,
    Private,
}

/// A typed parameter cell, with independent read/write access groups and
/// optional user hooks run on every read/write.
pub struct Parameter {
    name: String,
    ty: ParameterType,
    value: AtomicI64,
    read_group: AccessGroup,
    write_group: AccessGroup,
    read_hook: Option<Box<dyn Fn(i64) -> i64 + Send + Sync>>,
    write_hook: Option<Box<dyn Fn(i64) -> i64 + Send + Sync>>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("read_group", &self.read_group)
            .field("write_group", &self.write_group)
            .finish()
    }
}

impl Parameter {
    pub fn new(
        name: impl Into<String>,
        ty: ParameterType,
        default: i64,
        read_group: AccessGroup,
        write_group: AccessGroup,
    ) -> Self {
        Self {
            name: name.into(),
            value: AtomicI64::new(ty.truncate(default)),
            ty,
            read_group,
            write_group,
            read_hook: None,
            write_hook: None,
        }
    }

    pub fn with_hooks(
        mut self,
        read_hook: Option<Box<dyn Fn(i64) -> i64 + Send + Sync>>,
        write_hook: Option<Box<dyn Fn(i64) -> i64 + Send + Sync>>,
    ) -> Self {
        self.read_hook = read_hook;
        self.write_hook = write_hook;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> ParameterType {
        self.ty
    }

    /// Read the current value, gated by the declared read access group.
    /// `caller` is `Dependency` for any cross-instance access performed
    /// through `InstanceHandle::read_parameter` and `Private` is reserved
    /// for the owning instance's own code.
    pub fn read(&self, caller: AccessGroup) -> Result<i64> {
        if caller > self.read_group {
            return Err(FulcrumError::NotPermitted(format!(
                "parameter '{}' read requires access group <= {:?}",
                self.name, self.read_group
            )));
        }
        let raw = self.value.load(Ordering::SeqCst);
        Ok(match &self.read_hook {
            Some(hook) => hook(raw),
            None => raw,
        })
    }

    /// Write a new value, gated by the declared write access group.
    pub fn write(&self, caller: AccessGroup, value: i64) -> Result<()> {
        if caller > self.write_group {
            return Err(FulcrumError::NotPermitted(format!(
                "parameter '{}' write requires access group <= {:?}",
                self.name, self.write_group
            )));
        }
        let value = match &self.write_hook {
            Some(hook) => hook(value),
            None => value,
        };
        self.value.store(self.ty.truncate(value), Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_parameter_is_readable_and_writable_by_dependency() {
        let p = Parameter::new("count", ParameterType::U32, 0, AccessGroup::Public, AccessGroup::Public);
        assert!(p.write(AccessGroup::Dependency, 42).is_ok());
        assert_eq!(p.read(AccessGroup::Dependency).unwrap(), 42);
    }

    #[test]
    fn private_parameter_rejects_dependency_access() {
        let p = Parameter::new("secret", ParameterType::I32, 7, AccessGroup::Private, AccessGroup::Private);
        assert!(p.read(AccessGroup::Dependency).is_err());
        assert!(p.write(AccessGroup::Dependency, 1).is_err());
        // The owning instance accesses its own parameters at `Private`.
        assert_eq!(p.read(AccessGroup::Private).unwrap(), 7);
    }

    #[test]
    fn dependency_group_parameter_permits_dependency_but_not_stricter_callers() {
        let p = Parameter::new("shared", ParameterType::I16, 1, AccessGroup::Dependency, AccessGroup::Dependency);
        assert!(p.read(AccessGroup::Public).is_ok());
        assert!(p.read(AccessGroup::Dependency).is_ok());
    }

    #[test]
    fn narrower_integer_types_truncate_bit_exactly() {
        let p = Parameter::new("byte", ParameterType::U8, 0, AccessGroup::Public, AccessGroup::Public);
        p.write(AccessGroup::Public, 300).unwrap();
        assert_eq!(p.read(AccessGroup::Public).unwrap(), 300i64 as u8 as i64);
    }

    #[test]
    fn hooks_transform_reads_and_writes() {
        let p = Parameter::new("doubled", ParameterType::I32, 0, AccessGroup::Public, AccessGroup::Public)
            .with_hooks(Some(Box::new(|v| v * 2)), Some(Box::new(|v| v + 1)));
        p.write(AccessGroup::Public, 10).unwrap();
        // write_hook adds 1 before storing, read_hook doubles on the way out.
        assert_eq!(p.read(AccessGroup::Public).unwrap(), (10 + 1) * 2);
    }
}
