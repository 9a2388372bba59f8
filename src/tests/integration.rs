//! Integration tests: the scenarios the primitives are specified by, played
//! out across several kernel threads.

#[cfg(test)]
mod scenario_tests {
    use crate::hosted::HostedKernel;
    use crate::tests::helpers::assert_elapsed_between;
    use crate::thread::priority;
    use crate::{
        ClockId, CondVar, Kernel, Mutex, MutexType, RwSemaphore, Semaphore, SyncError, TlsRegistry,
    };
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant as StdInstant;
    use std::vec::Vec;

    #[test]
    fn test_mutex_contention() {
        let kernel = HostedKernel::new();
        let m = Mutex::new(&kernel, MutexType::Normal);
        let a_locked = Barrier::new(2);
        let b_tried = Barrier::new(2);
        let a_unlocked = Barrier::new(2);

        thread::scope(|s| {
            let a = kernel.spawn(s, priority::NORMAL, || {
                m.lock()?;
                a_locked.wait();
                b_tried.wait();
                m.unlock()?;
                a_unlocked.wait();
                Ok::<(), SyncError>(())
            });
            let b = kernel.spawn(s, priority::NORMAL, || {
                a_locked.wait();
                let first = m.trylock();
                b_tried.wait();
                a_unlocked.wait();
                let second = m.trylock();
                m.unlock()?;
                Ok::<_, SyncError>((first, second))
            });

            assert_eq!(a.join(), Ok(()));
            assert_eq!(b.join(), Ok((Err(SyncError::WouldBlock), Ok(()))));
        });
        assert!(!m.is_locked());
    }

    #[test]
    fn test_recursive_accounting() {
        const DEPTH: u32 = 5;
        let kernel = HostedKernel::new();
        let m = Mutex::new(&kernel, MutexType::Recursive);

        for _ in 0..DEPTH {
            m.lock().unwrap();
        }
        thread::scope(|s| {
            for remaining in (0..DEPTH).rev() {
                let other = kernel.spawn(s, priority::NORMAL, || m.trylock());
                assert_eq!(other.join(), Err(SyncError::WouldBlock));
                m.unlock().unwrap();
                assert_eq!(m.count(), remaining);
            }
            let other = kernel.spawn(s, priority::NORMAL, || m.trylock().and_then(|_| m.unlock()));
            assert_eq!(other.join(), Ok(()));
        });
    }

    #[test]
    fn test_timeout_correctness() {
        let kernel = HostedKernel::new();
        let m = Mutex::new(&kernel, MutexType::Normal);
        m.lock().unwrap();

        thread::scope(|s| {
            // Held for longer than the timeout.
            let late = kernel.spawn(s, priority::NORMAL, || {
                let start = StdInstant::now();
                let result = m.lock_timed(50);
                assert_elapsed_between(start, 49, 5_000);
                result
            });
            assert_eq!(late.join(), Err(SyncError::TimedOut));

            // Released before the timeout.
            let early = kernel.spawn(s, priority::NORMAL, || {
                m.lock_timed(10_000)?;
                m.unlock()
            });
            kernel.wait_until_blocked(early.id());
            m.unlock().unwrap();
            assert_eq!(early.join(), Ok(()));

            // An absolute deadline already in the past never blocks.
            m.lock().unwrap();
            let past = kernel.clock_time(ClockId::Realtime).add_millis(-1);
            let expired = kernel.spawn(s, priority::NORMAL, {
                let m = &m;
                move || {
                    let start = StdInstant::now();
                    let result = m.lock_until(&past);
                    assert_elapsed_between(start, 0, 100);
                    result
                }
            });
            assert_eq!(expired.join(), Err(SyncError::TimedOut));
        });
        m.unlock().unwrap();
    }

    #[test]
    fn test_semaphore_handoff() {
        let kernel = HostedKernel::new();
        let sem = Semaphore::init(&kernel, 0).unwrap();

        thread::scope(|s| {
            let a = kernel.spawn(s, priority::NORMAL, || sem.wait());
            kernel.wait_until_blocked(a.id());
            let b = kernel.spawn(s, priority::NORMAL, || sem.signal());
            assert_eq!(b.join(), Ok(()));
            assert_eq!(a.join(), Ok(()));
        });
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_rwsem_reader_count() {
        let kernel = HostedKernel::new();
        let rw = RwSemaphore::new(&kernel);
        let all_in = Barrier::new(4);
        let checked = Barrier::new(4);

        thread::scope(|s| {
            let readers: Vec<_> = (0..3)
                .map(|_| {
                    kernel.spawn(s, priority::NORMAL, || {
                        rw.read_lock()?;
                        all_in.wait();
                        checked.wait();
                        rw.read_unlock()
                    })
                })
                .collect();

            all_in.wait();
            assert_eq!(rw.read_count(), 3);
            assert_eq!(rw.write_trylock(), Err(SyncError::WouldBlock));
            checked.wait();
            for reader in readers {
                assert_eq!(reader.join(), Ok(()));
            }
        });

        rw.write_trylock().unwrap();
        rw.write_unlock().unwrap();
    }

    #[test]
    fn test_tls_per_thread_isolation() {
        let kernel = HostedKernel::new();
        let tls = TlsRegistry::new(&kernel);
        let key = tls.key_create(None).unwrap();
        let both_set = Barrier::new(2);

        thread::scope(|s| {
            let spawn_setter = |value: usize| {
                let (tls, both_set) = (&tls, &both_set);
                kernel.spawn(s, priority::NORMAL, move || {
                    tls.setspecific(key, value)?;
                    both_set.wait();
                    Ok::<_, SyncError>(tls.getspecific(key))
                })
            };
            let a = spawn_setter(1);
            let b = spawn_setter(2);
            assert_eq!(a.join(), Ok(Some(1)));
            assert_eq!(b.join(), Ok(Some(2)));
        });
        assert_eq!(tls.getspecific(key), None);
    }

    #[test]
    fn test_condvar_handshake() {
        let kernel = HostedKernel::new();
        let m = Mutex::new(&kernel, MutexType::Normal);
        let cv = CondVar::new(&kernel);
        let queue = spin::Mutex::new(Vec::new());

        thread::scope(|s| {
            let consumer = kernel.spawn(s, priority::NORMAL, || {
                let mut received = Vec::new();
                m.lock()?;
                while received.len() < 10 {
                    let batch: Vec<u32> = queue.lock().drain(..).collect();
                    if batch.is_empty() {
                        cv.wait(&m)?;
                    }
                    received.extend(batch);
                }
                m.unlock()?;
                Ok::<_, SyncError>(received)
            });

            for value in 0..10 {
                m.lock().unwrap();
                queue.lock().push(value);
                cv.signal();
                m.unlock().unwrap();
            }

            assert_eq!(consumer.join(), Ok((0..10).collect::<Vec<u32>>()));
        });
    }

    #[test]
    fn test_priority_inheritance_through_rwsem_writer() {
        let kernel = HostedKernel::new();
        let rw = RwSemaphore::new(&kernel);
        let me = kernel.current_thread();
        kernel.set_base_priority(me, priority::LOW);
        rw.write_lock().unwrap();

        thread::scope(|s| {
            let writer = kernel.spawn(s, priority::REALTIME, || {
                rw.write_lock()?;
                rw.write_unlock()
            });
            kernel.wait_until_blocked(writer.id());
            // The write mutex hands its waiter's priority to the holder.
            assert_eq!(kernel.priority(me), priority::REALTIME);
            rw.write_unlock().unwrap();
            assert_eq!(kernel.priority(me), priority::LOW);
            assert_eq!(writer.join(), Ok(()));
        });
    }
}

#[cfg(test)]
mod tls_lifecycle_tests {
    use crate::hosted::HostedKernel;
    use crate::thread::priority;
    use crate::{TlsKey, TlsRegistry};
    use std::sync::{Mutex as StdMutex, OnceLock};
    use std::thread;
    use std::vec::Vec;

    static KERNEL: OnceLock<HostedKernel> = OnceLock::new();
    static TLS: OnceLock<TlsRegistry<'static, HostedKernel>> = OnceLock::new();
    static CHAINED: OnceLock<TlsKey> = OnceLock::new();
    static LOG: StdMutex<Vec<(char, usize)>> = StdMutex::new(Vec::new());

    fn registry() -> &'static TlsRegistry<'static, HostedKernel> {
        TLS.get_or_init(|| TlsRegistry::new(KERNEL.get_or_init(HostedKernel::new)))
    }

    fn first_destructor(value: usize) {
        LOG.lock().unwrap().push(('a', value));
        // Cleanup that needs cleanup of its own.
        if let Some(key) = CHAINED.get() {
            registry().setspecific(*key, value + 1).unwrap();
        }
    }

    fn chained_destructor(value: usize) {
        LOG.lock().unwrap().push(('b', value));
    }

    #[test]
    fn test_exit_destructors_chain_across_passes() {
        let tls = registry();
        let kernel = KERNEL.get_or_init(HostedKernel::new);
        let first = tls.key_create(Some(first_destructor)).unwrap();
        let chained = tls.key_create(Some(chained_destructor)).unwrap();
        CHAINED.set(chained).unwrap();

        thread::scope(|s| {
            kernel
                .spawn(s, priority::NORMAL, || tls.setspecific(first, 100))
                .join()
                .unwrap();
        });

        let log = LOG.lock().unwrap();
        assert_eq!(*log, [('a', 100), ('b', 101)]);
    }
}
