//! Spawn descriptors: argv, environment, and working directory marshalled
//! into NUL-terminated arrays ahead of time, so the post-fork child can exec
//! without allocating.

use std::collections::HashMap;
use std::ffi::{CString, NulError, OsString};
use std::os::raw::c_char;

/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector to pass to `execve()`; the first entry is the
    /// executable path.
    argv: Vec<CString>,

    /// Environment for the child process. Inherits the parent's environment
    /// by default.
    env: OsEnv,

    /// Working directory to change to before exec, if any.
    cwd: Option<CString>,
}

impl Command {
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self, NulError> {
        if argv.is_empty() {
            panic!("Command exe required");
        }

        // Ensure we own NUL-terminated strings for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let argv: Result<Vec<_>, _> = argv.into_iter().map(CString::new).collect();
        let argv = argv?;

        let env = OsEnv::new()?;

        Ok(Self {
            argv,
            env,
            cwd: None,
        })
    }

    pub fn env(&mut self) -> &mut OsEnv {
        &mut self.env
    }

    /// Set the working directory the child changes to before exec.
    pub fn current_dir(mut self, dir: impl Into<Vec<u8>>) -> Result<Self, NulError> {
        self.cwd = Some(CString::new(dir)?);
        Ok(self)
    }

    pub(crate) fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub(crate) fn cwd(&self) -> Option<&CString> {
        self.cwd.as_ref()
    }

    pub(crate) fn env_snapshot(&self) -> OsEnv {
        self.env.clone()
    }
}

/// The environment a spawned child starts with.
#[derive(Clone, Debug)]
pub struct OsEnv {
    kvs: HashMap<OsString, CString>,
}

impl OsEnv {
    pub fn new() -> Result<Self, NulError> {
        let kvs = HashMap::new();
        let mut env = Self { kvs };

        // Inherit parent environment by default.
        for (key, val) in std::env::vars_os() {
            OsEnv::set(&mut env, key, val)?;
        }

        Ok(env)
    }

    pub fn set<K, V>(&mut self, key: K, val: V) -> Result<(), NulError>
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        use std::os::unix::ffi::OsStrExt;

        let key = key.into();
        let val = val.into();

        // Create an `OsString` of the form `${key}=${value}`.
        let mut kv = OsString::new();
        kv.push(&key);
        kv.push("=");
        kv.push(val);

        // NUL-terminate the KV string.
        let kv = CString::new(kv.as_bytes())?;

        self.kvs.insert(key, kv);

        Ok(())
    }

    pub fn clear(&mut self) {
        self.kvs.clear();
    }

    pub fn as_vec(&self) -> Vec<CString> {
        self.kvs.values().cloned().collect()
    }
}

/// View of a slice of `CString` values, as a null-terminated array of
/// pointers to `c_char`. For passing args to `execve()`.
pub(crate) struct NullTerminatedPointerArray<'a> {
    // Owned pointer array which must always be NULL-terminated.
    array: Vec<*const libc::c_char>,

    // Borrow of pointed-to `CString` data. Pointers in `array` are valid only
    // while we have this borrow.
    _data: &'a [CString],
}

impl<'a> NullTerminatedPointerArray<'a> {
    pub fn new(data: &'a [CString]) -> Self {
        let mut array: Vec<_> = data.iter().map(|s| s.as_ptr()).collect();
        array.push(std::ptr::null());

        Self { array, _data: data }
    }
}

impl std::ops::Deref for NullTerminatedPointerArray<'_> {
    type Target = [*const c_char];

    fn deref(&self) -> &Self::Target {
        &self.array
    }
}
