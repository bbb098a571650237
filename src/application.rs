use std::ffi::CString;
use std::fmt;
use std::path::PathBuf;

use lazy_static::lazy_static;
use log::debug;

use crate::error::{Error, Result};
use crate::kernel_buffer::KernelBuffer;
use crate::two_way_pipe::TwoWayPipe;

pub const ENV_APPLICATION_ID: &str = "APPLICATION_ID";
pub const ENV_PIPE_IN: &str = "PIPE_IN";
pub const ENV_PIPE_OUT: &str = "PIPE_OUT";
pub const ENV_SLAVE: &str = "SLAVE";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Master => "master",
            Role::Slave => "slave",
        })
    }
}

/// Everything needed to launch one copy of a distributed application:
/// credentials, command line, environment and working directory. The id is
/// a 64-bit random value drawn at construction on the master; slaves read
/// it from the environment.
#[derive(Clone)]
pub struct Application {
    id: u64,
    uid: u32,
    gid: u32,
    args: Vec<String>,
    env: Vec<String>,
    workdir: PathBuf,
    allow_root: bool,
    role: Role,
}

impl Application {
    pub fn new(args: Vec<String>, env: Vec<String>) -> Result<Application> {
        if args.is_empty() {
            return Err(Error::config("empty application arguments"));
        }
        Ok(Application {
            id: rand::random(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            args,
            env,
            workdir: PathBuf::new(),
            allow_root: false,
            role: Role::Master,
        })
    }

    /// A blank record for deserialization.
    pub fn empty() -> Application {
        Application {
            id: 0,
            uid: 0,
            gid: 0,
            args: Vec::new(),
            env: Vec::new(),
            workdir: PathBuf::new(),
            allow_root: false,
            role: Role::Master,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn filename(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_role(&mut self, rhs: Role) {
        self.role = rhs;
    }

    pub fn is_slave(&self) -> bool {
        self.role == Role::Slave
    }

    pub fn allow_root(&self) -> bool {
        self.allow_root
    }

    pub fn set_allow_root(&mut self, rhs: bool) {
        self.allow_root = rhs;
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    pub fn set_workdir<P: Into<PathBuf>>(&mut self, rhs: P) {
        self.workdir = rhs.into();
    }

    pub fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        out.write_u64(self.id);
        out.write_u32(self.uid);
        out.write_u32(self.gid);
        write_string_vec(out, &self.args);
        write_string_vec(out, &self.env);
        out.write_str(&self.workdir.to_string_lossy());
        Ok(())
    }

    pub fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.id = input.read_u64()?;
        self.uid = input.read_u32()?;
        self.gid = input.read_u32()?;
        self.args = read_string_vec(input)?;
        self.env = read_string_vec(input)?;
        self.workdir = PathBuf::from(input.read_str()?);
        Ok(())
    }

    /// Replace the current process image with this application. Runs in the
    /// forked child; on success it never returns. The child's pipe ends are
    /// published through `PIPE_IN`/`PIPE_OUT`.
    pub fn execute(&self, pipe: &TwoWayPipe) -> Result<()> {
        if !self.allow_root && (self.uid == 0 || self.gid == 0) {
            return Err(Error::config(
                "executing as superuser/supergroup is disallowed",
            ));
        }
        let mut env = self.env.clone();
        env.push(format!("{}={}", ENV_APPLICATION_ID, self.id));
        env.push(format!("{}={}", ENV_PIPE_IN, pipe.child_in()));
        env.push(format!("{}={}", ENV_PIPE_OUT, pipe.child_out()));
        if self.is_slave() {
            env.push(format!("{}=1", ENV_SLAVE));
        }
        pipe.keep_child_ends_across_exec()?;
        if nix::unistd::getgid().as_raw() != self.gid {
            nix::unistd::setgid(nix::unistd::Gid::from_raw(self.gid))?;
        }
        if nix::unistd::getuid().as_raw() != self.uid {
            nix::unistd::setuid(nix::unistd::Uid::from_raw(self.uid))?;
        }
        if !self.workdir.as_os_str().is_empty() {
            nix::unistd::chdir(&self.workdir)?;
        }
        debug!("app: execute {:?}", self.args);
        let argv = to_cstrings(&self.args)?;
        let envp = to_cstrings(&env)?;
        let argv_ptrs = to_ptr_array(&argv);
        let envp_ptrs = to_ptr_array(&envp);
        // SAFETY: both arrays are NULL-terminated and outlive the call;
        // execvpe only returns on failure.
        unsafe {
            libc::execvpe(argv[0].as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
        }
        Err(nix::Error::last().into())
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id {} uid {} gid {} role {} command {:?} wd {:?}}}",
            self.id, self.uid, self.gid, self.role, self.args, self.workdir
        )
    }
}

fn write_string_vec(out: &mut KernelBuffer, v: &[String]) {
    out.write_u32(v.len() as u32);
    for s in v {
        out.write_str(s);
    }
}

fn read_string_vec(input: &mut KernelBuffer) -> Result<Vec<String>> {
    let n = input.read_u32()? as usize;
    let mut v = Vec::new();
    for _ in 0..n {
        v.push(input.read_str()?);
    }
    Ok(v)
}

fn to_cstrings(v: &[String]) -> Result<Vec<CString>> {
    v.iter()
        .map(|s| CString::new(s.as_bytes()).map_err(|_| Error::config("NUL byte in argument")))
        .collect()
}

fn to_ptr_array(v: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = v.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Identity of the running process inside the cluster, read from the
/// environment exactly once. A process launched outside the runtime has
/// application id zero and no pipes.
pub mod this_application {
    use super::*;
    use std::os::unix::io::RawFd;

    struct Snapshot {
        id: u64,
        pipe_in: RawFd,
        pipe_out: RawFd,
        is_master: bool,
    }

    lazy_static! {
        static ref THIS: Snapshot = Snapshot {
            id: read_env_u64(ENV_APPLICATION_ID),
            pipe_in: read_env_fd(ENV_PIPE_IN),
            pipe_out: read_env_fd(ENV_PIPE_OUT),
            is_master: std::env::var_os(ENV_SLAVE).is_none(),
        };
    }

    fn read_env_u64(name: &str) -> u64 {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn read_env_fd(name: &str) -> RawFd {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-1)
    }

    pub fn id() -> u64 {
        THIS.id
    }

    pub fn input_fd() -> RawFd {
        THIS.pipe_in
    }

    pub fn output_fd() -> RawFd {
        THIS.pipe_out
    }

    pub fn is_master() -> bool {
        THIS.is_master
    }

    pub fn is_slave() -> bool {
        !THIS.is_master
    }

    /// True when this process was spawned by a daemon and owns kernel
    /// pipes.
    pub fn is_managed() -> bool {
        THIS.pipe_in >= 0 && THIS.pipe_out >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_random_and_nonzero_in_practice() {
        let a = Application::new(vec!["true".into()], vec![]).unwrap();
        let b = Application::new(vec!["true".into()], vec![]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn empty_arguments_are_refused() {
        assert!(Application::new(vec![], vec![]).is_err());
    }

    #[test]
    fn wire_round_trip() {
        let mut a = Application::new(
            vec!["solver".into(), "--grid".into(), "128".into()],
            vec!["PATH=/usr/bin".into()],
        )
        .unwrap();
        a.set_workdir("/var/tmp");
        let mut buf = KernelBuffer::new();
        a.write(&mut buf).unwrap();
        buf.flip();
        let mut b = Application::empty();
        b.read(&mut buf).unwrap();
        assert_eq!(b.id(), a.id());
        assert_eq!(b.uid(), a.uid());
        assert_eq!(b.gid(), a.gid());
        assert_eq!(b.arguments(), a.arguments());
        assert_eq!(b.workdir(), a.workdir());
        assert_eq!(buf.position(), buf.limit());
    }
}
