use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{lseek, Whence};

use crate::application::this_application;
use crate::error::{Error, Result};
use crate::instance_registry::InstanceRegistry;
use crate::kernel::{Kernel, KernelPtr};
use crate::kernel_buffer::{KernelBuffer, KernelReadGuard, KernelWriteGuard};
use crate::pipeline::Pipeline;
use crate::scoped_fd::ScopedFd;
use crate::type_registry::TypeRegistry;

const STATUS_START: u8 = 1;
const STATUS_END: u8 = 2;

/// Append-only record of in-flight upstream kernels, framed exactly like
/// wire packets. A `Start` record embeds the kernel (with its carried
/// parent); an `End` record carries only the kernel id. On open, a
/// non-empty log is compacted: ended kernels are dropped, the remainder is
/// rewritten atomically, and survivors that carry their parent are
/// resubmitted to the pipeline recorded with them.
///
/// Writes are dsync'd; recovery runs before any pipeline thread starts, so
/// the file has exactly one writer.
pub struct TransactionLog {
    inner: Mutex<Inner>,
}

struct Inner {
    fd: ScopedFd,
    buffer: KernelBuffer,
    path: PathBuf,
}

impl TransactionLog {
    pub fn new(types: Arc<TypeRegistry>) -> TransactionLog {
        let mut buffer = KernelBuffer::new();
        buffer.set_types(types);
        TransactionLog {
            inner: Mutex::new(Inner {
                fd: ScopedFd::new(),
                buffer,
                path: PathBuf::new(),
            }),
        }
    }

    /// Open (and, if the file is non-empty, recover) the log.
    pub fn open<P: AsRef<Path>>(
        &self,
        path: P,
        pipelines: &[Arc<dyn Pipeline>],
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut inner = self.inner.lock().unwrap();
        inner.path = path.clone();
        inner.fd = open_log(&path)?;
        let offset = lseek(inner.fd.get(), 0, Whence::SeekEnd)?;
        debug!("log: file {:?} offset {}", path, offset);
        if offset != 0 {
            inner.fd.close();
            recover(&mut inner, pipelines)?;
        }
        Ok(())
    }

    pub fn write_start(
        &self,
        pipeline_index: u16,
        k: &dyn Kernel,
        instances: &InstanceRegistry,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.fd.is_open() {
            return Ok(());
        }
        {
            let mut guard = KernelWriteGuard::new(&mut inner.buffer);
            guard.write_u8(STATUS_START);
            guard.write_u16(pipeline_index);
            if let Err(e) = guard.write_kernel(k, Some(instances)) {
                guard.cancel();
                return Err(e);
            }
        }
        debug!("log: store {:?}", k.base());
        inner.flush()
    }

    pub fn write_end(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.fd.is_open() {
            return Ok(());
        }
        {
            let mut guard = KernelWriteGuard::new(&mut inner.buffer);
            guard.write_u8(STATUS_END);
            guard.write_u16(0);
            guard.write_u64(id);
        }
        debug!("log: end {}", id);
        inner.flush()
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().fd.close();
    }
}

impl Inner {
    fn flush(&mut self) -> Result<()> {
        let fd = self.fd.get();
        self.buffer.flip();
        let result = self.buffer.flush(fd);
        self.buffer.compact();
        result.map(|_| ())
    }
}

fn open_log(path: &Path) -> Result<ScopedFd> {
    let fd = nix::fcntl::open(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_CLOEXEC | OFlag::O_DSYNC,
        Mode::from_bits_truncate(0o600),
    )?;
    Ok(ScopedFd::from_raw(fd))
}

fn recover(inner: &mut Inner, pipelines: &[Arc<dyn Pipeline>]) -> Result<()> {
    debug!("log: recover {:?}", inner.path);
    let read_fd = ScopedFd::from_raw(nix::fcntl::open(
        &inner.path,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?);
    let mut records: Vec<(u16, KernelPtr)> = Vec::new();
    let mut buf = KernelBuffer::new();
    if let Some(types) = inner.buffer.types() {
        buf.set_types(types.clone());
    }
    loop {
        let (_, eof) = buf.fill(read_fd.get())?;
        buf.flip();
        loop {
            let frame = {
                let mut guard = KernelReadGuard::new(&mut buf);
                if !guard.is_good() {
                    break;
                }
                read_record(&mut guard)
            };
            match frame {
                Ok(Record::Start(index, kernel)) => records.push((index, kernel)),
                Ok(Record::End(id)) => records.retain(|(_, k)| k.base().id() != id),
                Err(e) => warn!("log: bad record: {}", e),
            }
        }
        buf.compact();
        if eof {
            break;
        }
    }
    drop(read_fd);
    buf.clear();
    let buf = &mut buf;
    // Keep only kernels that can be reconstructed standalone and still
    // have a pipeline to go to.
    let mut survivors = Vec::new();
    for (index, k) in records {
        if (index as usize) >= pipelines.len() {
            debug!("log: wrong pipeline index {}, dropping {:?}", index, k.base());
        } else if !k.base().carries_parent() {
            debug!("log: does not carry parent, dropping {:?}", k.base());
        } else {
            survivors.push((index, k));
        }
    }
    // Rewrite the survivors and rename over the old file.
    let new_path = {
        let mut p = inner.path.clone().into_os_string();
        p.push(".new");
        PathBuf::from(p)
    };
    {
        let new_fd = ScopedFd::from_raw(nix::fcntl::open(
            &new_path,
            OFlag::O_WRONLY
                | OFlag::O_CREAT
                | OFlag::O_TRUNC
                | OFlag::O_CLOEXEC
                | OFlag::O_DSYNC,
            Mode::from_bits_truncate(0o600),
        )?);
        for (index, k) in &survivors {
            let mut guard = KernelWriteGuard::new(buf);
            guard.write_u8(STATUS_START);
            guard.write_u16(*index);
            if let Err(e) = guard.write_kernel(&**k, None) {
                guard.cancel();
                warn!("log: rewrite failed: {}", e);
            }
        }
        buf.flip();
        buf.flush(new_fd.get())?;
        buf.compact();
    }
    std::fs::rename(&new_path, &inner.path)?;
    inner.fd = open_log(&inner.path)?;
    lseek(inner.fd.get(), 0, Whence::SeekEnd)?;
    // Send the recovered kernels to their original lanes.
    for (index, k) in survivors {
        debug!("log: restore {:?}", k.base());
        pipelines[index as usize].send(k);
    }
    Ok(())
}

enum Record {
    Start(u16, KernelPtr),
    End(u64),
}

fn read_record(guard: &mut KernelReadGuard<'_>) -> Result<Record> {
    let status = guard.read_u8()?;
    let index = guard.read_u16()?;
    match status {
        STATUS_START => {
            let kernel = guard.read_kernel(this_application::id())?;
            Ok(Record::Start(index, kernel))
        }
        STATUS_END => Ok(Record::End(guard.read_u64()?)),
        s => Err(Error::protocol(format!("bad transaction status {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Context, KernelBase, KernelFlags};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Job {
        base: KernelBase,
        step: u32,
    }

    impl Kernel for Job {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
        fn act(&mut self, _ctx: &mut Context) {}
        fn write(&self, out: &mut KernelBuffer) -> Result<()> {
            self.base.write(out)?;
            out.write_u32(self.step);
            Ok(())
        }
        fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
            self.base.read(input)?;
            self.step = input.read_u32()?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingPipeline {
        kernels: StdMutex<Vec<KernelPtr>>,
    }

    impl Pipeline for CollectingPipeline {
        fn send(&self, k: KernelPtr) {
            self.kernels.lock().unwrap().push(k);
        }
    }

    fn types() -> Arc<TypeRegistry> {
        let t = TypeRegistry::new();
        t.register::<Job>(55).unwrap();
        Arc::new(t)
    }

    fn carried_job(id: u64, step: u32) -> Box<Job> {
        let mut parent = Box::new(Job::default());
        parent.base_mut().set_id(id + 1000);
        let mut k = Box::new(Job::default());
        k.step = step;
        k.base_mut().set_id(id);
        k.base_mut().setf(KernelFlags::CARRIES_PARENT);
        k.base_mut().set_parent_owned(parent);
        k
    }

    #[test]
    fn matched_start_end_compacts_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let instances = InstanceRegistry::new();
        {
            let log = TransactionLog::new(types());
            log.open(&path, &[]).unwrap();
            let k = carried_job(70, 1);
            log.write_start(0, &*k, &instances).unwrap();
            log.write_end(70).unwrap();
            log.close();
        }
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        let pipeline = Arc::new(CollectingPipeline::default());
        let pipelines: Vec<Arc<dyn Pipeline>> = vec![pipeline.clone()];
        let log = TransactionLog::new(types());
        log.open(&path, &pipelines).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(pipeline.kernels.lock().unwrap().is_empty());
    }

    #[test]
    fn survivor_with_parent_is_resubmitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let instances = InstanceRegistry::new();
        {
            let log = TransactionLog::new(types());
            log.open(&path, &[]).unwrap();
            let k = carried_job(71, 9);
            log.write_start(0, &*k, &instances).unwrap();
            log.close();
        }
        let pipeline = Arc::new(CollectingPipeline::default());
        let pipelines: Vec<Arc<dyn Pipeline>> = vec![pipeline.clone()];
        let log = TransactionLog::new(types());
        log.open(&path, &pipelines).unwrap();
        let kernels = pipeline.kernels.lock().unwrap();
        assert_eq!(kernels.len(), 1);
        let job = kernels[0].downcast_ref::<Job>().unwrap();
        assert_eq!(job.step, 9);
        assert_eq!(job.base().id(), 71);
        assert!(job.base().parent().owned().is_some());
        drop(kernels);
        // The rewritten file still holds the survivor.
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn survivor_without_parent_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let instances = InstanceRegistry::new();
        {
            let log = TransactionLog::new(types());
            log.open(&path, &[]).unwrap();
            let mut k = Box::new(Job::default());
            k.base_mut().set_id(72);
            log.write_start(0, &*k, &instances).unwrap();
            log.close();
        }
        let pipeline = Arc::new(CollectingPipeline::default());
        let pipelines: Vec<Arc<dyn Pipeline>> = vec![pipeline.clone()];
        let log = TransactionLog::new(types());
        log.open(&path, &pipelines).unwrap();
        assert!(pipeline.kernels.lock().unwrap().is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
