// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! End-to-end scenarios for the incremental build engine, driven through
//! the public API against real scratch trees.

use filebuild::{build, clean, error_kind, BuildErrorKind, Builder, DigestData, Engine, Result};
use std::{
    fs,
    io::Write,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::channel,
        Arc,
    },
    thread,
    time::Duration,
};
use tectonic_errors::prelude::*;

struct Tree {
    _dir: tempfile::TempDir,
    cache: String,
    input: String,
    output: String,
}

fn setup() -> Tree {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_owned();
    let input = format!("{}/in", root);
    let output = format!("{}/out", root);
    fs::create_dir(&input).unwrap();
    fs::create_dir(&output).unwrap();

    Tree {
        cache: format!("{}/cache.bin", root),
        input,
        output,
        _dir: dir,
    }
}

/// The stand-in for a compression tool: a reversible, content-dependent
/// transform.
fn crush(data: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = data.iter().rev().copied().collect();
    out.push(b'!');
    out
}

/// A top-level function in the style of the directory-compressor client:
/// one `build_file` per input file, outputs named after the inputs.
fn crush_tree(b: &Builder, input: &str, output: &str, runs: &AtomicUsize) -> Result<Vec<String>> {
    let mut produced = Vec::new();

    for name in b.list_dir(input)? {
        let src = format!("{}/{}", input, name);
        let dst = format!("{}/{}.cr", output, name);

        b.build_file("crush_one", &dst, &src, |bf| {
            runs.fetch_add(1, Ordering::SeqCst);
            let data = bf.read_binary(&src)?;
            let mut stream = bf.output_stream()?;
            stream.write_all(&crush(&data))?;
            stream.close()?;
            Ok(())
        })?;

        produced.push(dst);
    }

    Ok(produced)
}

#[test]
fn rebuild_without_changes_is_a_no_op() {
    let t = setup();
    fs::write(format!("{}/a.txt", t.input), b"hello").unwrap();
    fs::write(format!("{}/b.txt", t.input), b"world").unwrap();

    let runs = AtomicUsize::new(0);
    let go = || {
        build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
            crush_tree(b, &t.input, &t.output, &runs)
        })
    };

    let first: Vec<String> = go().unwrap();
    assert!(runs.load(Ordering::SeqCst) == 2);
    assert!(fs::read(format!("{}/a.txt.cr", t.output)).unwrap() == crush(b"hello"));

    let second: Vec<String> = go().unwrap();
    assert!(second == first);
    assert!(runs.load(Ordering::SeqCst) == 2);
    assert!(fs::read(format!("{}/a.txt.cr", t.output)).unwrap() == crush(b"hello"));
    assert!(fs::read(format!("{}/b.txt.cr", t.output)).unwrap() == crush(b"world"));
}

#[test]
fn changed_input_reruns_only_its_operation() {
    let t = setup();
    let a = format!("{}/a.txt", t.input);
    fs::write(&a, b"hello").unwrap();
    fs::write(format!("{}/b.txt", t.input), b"world").unwrap();

    let runs = AtomicUsize::new(0);
    let go = || {
        build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
            crush_tree(b, &t.input, &t.output, &runs)
        })
    };

    go().unwrap();
    assert!(runs.load(Ordering::SeqCst) == 2);
    let before = fs::read(format!("{}/a.txt.cr", t.output)).unwrap();

    fs::write(&a, b"hello!").unwrap();
    go().unwrap();

    // Only the operation for `a` re-ran, and its output really changed.
    assert!(runs.load(Ordering::SeqCst) == 3);
    let after = fs::read(format!("{}/a.txt.cr", t.output)).unwrap();
    assert!(after == crush(b"hello!"));
    assert!(after != before);
}

#[test]
fn content_change_with_unchanged_mtime_still_invalidates() {
    let t = setup();
    let a = format!("{}/a.txt", t.input);
    fs::write(&a, b"aaaa").unwrap();

    let runs = AtomicUsize::new(0);
    let go = || {
        build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
            crush_tree(b, &t.input, &t.output, &runs)
        })
    };

    go().unwrap();
    assert!(runs.load(Ordering::SeqCst) == 1);

    // Same length, same mtime, different bytes.
    let md = fs::metadata(&a).unwrap();
    let mtime = filetime::FileTime::from_last_modification_time(&md);
    fs::write(&a, b"bbbb").unwrap();
    filetime::set_file_mtime(&a, mtime).unwrap();

    go().unwrap();
    assert!(runs.load(Ordering::SeqCst) == 2);
    assert!(fs::read(format!("{}/a.txt.cr", t.output)).unwrap() == crush(b"bbbb"));
}

#[test]
fn version_bump_reruns_regardless_of_content() {
    let t = setup();
    fs::write(format!("{}/a.py", t.input), b"print(1)").unwrap();
    fs::write(format!("{}/b.py", t.input), b"print(2)").unwrap();

    let runs = Arc::new(AtomicUsize::new(0));

    let lint = |version: u32| -> Result<usize> {
        let input = t.input.clone();
        let runs = runs.clone();

        build(&t.cache, "lint_tree", &t.input, move |b| {
            let mut n_issues = 0;

            for name in b.list_dir(&input)? {
                let path = format!("{}/{}", input, name);
                let path_inner = path.clone();
                let runs = runs.clone();

                n_issues += b.subbuild_versioned("lint_file", version, &path, move |bf| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let text = bf.read_text(&path_inner)?;
                    Ok(text.matches("print").count())
                })?;
            }

            Ok(n_issues)
        })
    };

    assert!(lint(1).unwrap() == 2);
    assert!(runs.load(Ordering::SeqCst) == 2);

    assert!(lint(1).unwrap() == 2);
    assert!(runs.load(Ordering::SeqCst) == 2);

    // Bumping the version re-runs every file even though nothing changed.
    assert!(lint(2).unwrap() == 2);
    assert!(runs.load(Ordering::SeqCst) == 4);
}

#[test]
fn failed_build_rolls_back_files_and_cache() {
    let t = setup();
    let a = format!("{}/a.txt", t.input);
    fs::write(&a, b"hello").unwrap();

    let runs = AtomicUsize::new(0);
    let go = |fail: bool| -> Result<Vec<String>> {
        build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
            let produced = crush_tree(b, &t.input, &t.output, &runs)?;
            ensure!(!fail, "the build function exploded");
            Ok(produced)
        })
    };

    go(false).unwrap();
    assert!(runs.load(Ordering::SeqCst) == 1);
    let committed = fs::read(format!("{}/a.txt.cr", t.output)).unwrap();

    // Invalidate the operation so the failing run really rewrites the file.
    fs::write(&a, b"hello!").unwrap();
    let err = go(true).unwrap_err();
    assert!(format!("{:#}", err).contains("exploded"));
    assert!(runs.load(Ordering::SeqCst) == 2);

    // The output is back to its pre-build contents...
    assert!(fs::read(format!("{}/a.txt.cr", t.output)).unwrap() == committed);

    // ...and the cache still describes the last successful build: reverting
    // the input makes the next run a pure cache hit.
    fs::write(&a, b"hello").unwrap();
    go(false).unwrap();
    assert!(runs.load(Ordering::SeqCst) == 2);
}

#[test]
fn preexisting_file_at_an_output_path_survives_failure() {
    let t = setup();
    fs::write(format!("{}/a.txt", t.input), b"fresh").unwrap();
    let collided = format!("{}/a.txt.cr", t.output);
    fs::write(&collided, b"old").unwrap();

    let runs = AtomicUsize::new(0);
    let err = build::<_, Vec<String>, _>(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
        let produced = crush_tree(b, &t.input, &t.output, &runs)?;
        bail!("raising after writing {} file(s)", produced.len());
    })
    .unwrap_err();

    assert!(error_kind(&err) == BuildErrorKind::UserFunction);
    assert!(fs::read(&collided).unwrap() == b"old");
}

#[test]
fn clean_removes_outputs_and_forgets_everything() {
    let t = setup();
    fs::write(format!("{}/a.txt", t.input), b"hello").unwrap();

    let runs = AtomicUsize::new(0);
    let go = || {
        build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
            crush_tree(b, &t.input, &t.output, &runs)
        })
    };

    let first: Vec<String> = go().unwrap();
    let bytes = fs::read(&first[0]).unwrap();

    clean(&t.cache).unwrap();
    assert!(!Path::new(&first[0]).exists());

    // Idempotent.
    clean(&t.cache).unwrap();

    // The round trip reproduces byte-identical outputs, from scratch.
    let second: Vec<String> = go().unwrap();
    assert!(second == first);
    assert!(runs.load(Ordering::SeqCst) == 2);
    assert!(fs::read(&first[0]).unwrap() == bytes);
}

#[test]
fn deleted_input_orphans_its_output() {
    let t = setup();
    let a = format!("{}/a.txt", t.input);
    fs::write(&a, b"hello").unwrap();
    fs::write(format!("{}/b.txt", t.input), b"world").unwrap();

    let runs = AtomicUsize::new(0);
    let go = || {
        build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
            crush_tree(b, &t.input, &t.output, &runs)
        })
    };

    let first: Vec<String> = go().unwrap();
    assert!(first.len() == 2);

    fs::remove_file(&a).unwrap();
    let second: Vec<String> = go().unwrap();

    // The vanished input's operation was never invoked again; its stale
    // output was deleted as an orphan; the other file was a pure hit.
    assert!(second == vec![format!("{}/b.txt.cr", t.output)]);
    assert!(runs.load(Ordering::SeqCst) == 2);
    assert!(!Path::new(&format!("{}/a.txt.cr", t.output)).exists());
    assert!(Path::new(&format!("{}/b.txt.cr", t.output)).exists());
}

#[test]
fn stale_outputs_are_invisible_during_the_build() {
    let t = setup();
    let a = format!("{}/a.txt", t.input);
    fs::write(&a, b"hello").unwrap();

    let runs = AtomicUsize::new(0);

    let _: Vec<String> = build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
        crush_tree(b, &t.input, &t.output, &runs)
    })
    .unwrap();

    fs::remove_file(&a).unwrap();

    // While the second build runs, the orphan is physically present but the
    // session view must already report a clean slate.
    let observed: Vec<String> = build(&t.cache, "crush_tree", (&t.input, &t.output), |b| {
        let produced = crush_tree(b, &t.input, &t.output, &runs)?;
        ensure!(produced.is_empty(), "an input came back from the dead");
        ensure!(
            !b.exists(format!("{}/a.txt.cr", t.output))?,
            "a stale output is visible in the session view"
        );
        b.list_dir(&t.output)
    })
    .unwrap();

    assert!(observed.is_empty());
    assert!(!Path::new(&format!("{}/a.txt.cr", t.output)).exists());
}

#[test]
fn parallel_operations_run_and_collapse_correctly() {
    let t = setup();

    for i in 0..4 {
        fs::write(format!("{}/f{}.txt", t.input, i), format!("data {}", i)).unwrap();
    }

    let distinct_runs = Arc::new(AtomicUsize::new(0));
    let shared_runs = Arc::new(AtomicUsize::new(0));
    let pool = threadpool::ThreadPool::new(8);

    let total: u32 = build(&t.cache, "parallel", (&t.input, &t.output), |b| {
        let (tx, rx) = channel();
        let (stx, srx) = channel();

        // Four independent file operations on four worker threads.
        for i in 0..4u32 {
            let b = b.clone();
            let tx = tx.clone();
            let src = format!("{}/f{}.txt", t.input, i);
            let dst = format!("{}/f{}.cr", t.output, i);
            let runs = distinct_runs.clone();

            pool.execute(move || {
                let r = b.build_file("crush_one", &dst, &src, |bf| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let data = bf.read_binary(&src)?;
                    let mut stream = bf.output_stream()?;
                    stream.write_all(&crush(&data))?;
                    stream.close()?;
                    Ok(())
                });
                tx.send(r.map(|_| ())).unwrap();
            });
        }

        // Two racing invocations of the *same* operation: exactly one
        // function run, both callers observing the same result.
        let shared = format!("{}/shared.cr", t.output);

        for _ in 0..2 {
            let b = b.clone();
            let stx = stx.clone();
            let dst = shared.clone();
            let runs = shared_runs.clone();

            pool.execute(move || {
                let r = b.build_file("mk_shared", &dst, (), |bf| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(25));
                    let mut stream = bf.output_stream()?;
                    stream.write_all(b"only once")?;
                    stream.close()?;
                    Ok(())
                });
                stx.send(r).unwrap();
            });
        }

        drop(tx);
        drop(stx);

        for r in rx {
            r?;
        }

        let mut shared_digests: Vec<DigestData> = Vec::new();

        for r in srx {
            shared_digests.push(r?);
        }

        ensure!(shared_digests.len() == 2, "lost a racing caller");
        ensure!(
            shared_digests[0] == shared_digests[1],
            "racing callers observed different results"
        );

        Ok(4)
    })
    .unwrap();

    assert!(total == 4);
    assert!(distinct_runs.load(Ordering::SeqCst) == 4);
    assert!(shared_runs.load(Ordering::SeqCst) == 1);

    for i in 0..4 {
        let data = fs::read(format!("{}/f{}.cr", t.output, i)).unwrap();
        assert!(data == crush(format!("data {}", i).as_bytes()));
    }

    assert!(fs::read(format!("{}/shared.cr", t.output)).unwrap() == b"only once");
}

#[test]
fn dependency_cycles_are_reported() {
    let t = setup();

    let err = build::<_, u32, _>(&t.cache, "cyclic", (), |b| {
        b.subbuild("spin", (), |b2| b2.subbuild("spin", (), |_| Ok(1u32)))
    })
    .unwrap_err();

    assert!(error_kind(&err) == BuildErrorKind::Programming);
    assert!(format!("{:#}", err).contains("cycle"));
}

#[test]
fn output_path_collisions_are_reported() {
    let t = setup();
    let dst = format!("{}/same.txt", t.output);

    let err = build::<_, u32, _>(&t.cache, "colliding", (), |b| {
        b.build_file("writer_a", &dst, (), |bf| {
            bf.build_file("writer_b", &dst, (), |bf2| {
                let mut stream = bf2.output_stream()?;
                stream.write_all(b"b")?;
                stream.close()?;
                Ok(())
            })
            .map(|_| ())
        })?;
        Ok(0)
    })
    .unwrap_err();

    assert!(error_kind(&err) == BuildErrorKind::Programming);
}

#[test]
fn comparison_hook_suppresses_downstream_invalidation() {
    let t = setup();
    let src = format!("{}/data.txt", t.input);
    let gen = format!("{}/gen.txt", t.output);
    fs::write(&src, b"keep # one").unwrap();

    let gen_runs = Arc::new(AtomicUsize::new(0));
    let use_runs = Arc::new(AtomicUsize::new(0));

    let go = || -> Result<String> {
        let src_arg = src.clone();
        let src_cl = src.clone();
        let gen_cl = gen.clone();
        let gen_runs = gen_runs.clone();
        let use_runs = use_runs.clone();

        build(&t.cache, "stemmed", &src_arg, move |b| {
            let src_inner = src_cl.clone();
            let gr = gen_runs.clone();

            b.build_file_with_comparison(
                "generate",
                &gen_cl,
                &src_cl,
                move |bf| {
                    gr.fetch_add(1, Ordering::SeqCst);
                    let data = bf.read_binary(&src_inner)?;
                    let mut stream = bf.output_stream()?;
                    stream.write_all(&data)?;
                    stream.close()?;
                    Ok(())
                },
                |old, new| {
                    let a = fs::read_to_string(old)?;
                    let b = fs::read_to_string(new)?;
                    Ok(a.split('#').next() == b.split('#').next())
                },
            )?;

            let gen_inner = gen_cl.clone();
            let ur = use_runs.clone();

            b.subbuild("consume", &gen_cl, move |bf| {
                ur.fetch_add(1, Ordering::SeqCst);
                bf.read_text(&gen_inner)
            })
        })
    };

    let v1 = go().unwrap();
    assert!(v1 == "keep # one");
    assert!(gen_runs.load(Ordering::SeqCst) == 1);
    assert!(use_runs.load(Ordering::SeqCst) == 1);

    // The input changes, but only in the part the comparator ignores: the
    // generator re-runs, the old bytes are kept, and the consumer stays a
    // cache hit.
    fs::write(&src, b"keep # two").unwrap();
    let v2 = go().unwrap();
    assert!(v2 == "keep # one");
    assert!(gen_runs.load(Ordering::SeqCst) == 2);
    assert!(use_runs.load(Ordering::SeqCst) == 1);
    assert!(fs::read(&gen).unwrap() == b"keep # one");

    // A change the comparator cares about flows all the way through.
    fs::write(&src, b"replace # three").unwrap();
    let v3 = go().unwrap();
    assert!(v3 == "replace # three");
    assert!(gen_runs.load(Ordering::SeqCst) == 3);
    assert!(use_runs.load(Ordering::SeqCst) == 2);
}

#[test]
fn walk_tracks_tree_shape() {
    let t = setup();
    fs::create_dir_all(format!("{}/sub", t.input)).unwrap();
    fs::write(format!("{}/top.txt", t.input), b"t").unwrap();
    fs::write(format!("{}/sub/deep.txt", t.input), b"d").unwrap();

    let census_runs = Arc::new(AtomicUsize::new(0));

    let go = || -> Result<Vec<String>> {
        let input = t.input.clone();
        let runs = census_runs.clone();

        build(&t.cache, "census", &t.input, move |b| {
            let input = input.clone();
            let input_args = input.clone();
            let runs = runs.clone();

            b.subbuild("walk_census", &input_args, move |bc| {
                runs.fetch_add(1, Ordering::SeqCst);
                let mut seen = Vec::new();

                for step in bc.walk(&input) {
                    let step = step?;
                    for f in &step.files {
                        seen.push(format!("{}/{}", step.dir, f));
                    }
                }

                seen.sort();
                Ok(seen)
            })
        })
    };

    let first = go().unwrap();
    assert!(first.len() == 2);
    assert!(census_runs.load(Ordering::SeqCst) == 1);

    // No changes: the walk's recorded listings validate and the census is
    // never recomputed.
    let second = go().unwrap();
    assert!(second == first);
    assert!(census_runs.load(Ordering::SeqCst) == 1);

    // A new file in a subdirectory invalidates through the listing fact.
    fs::write(format!("{}/sub/new.txt", t.input), b"n").unwrap();
    let third = go().unwrap();
    assert!(third.len() == 3);
    assert!(census_runs.load(Ordering::SeqCst) == 2);
}

#[test]
fn unencodable_subbuild_values_are_programming_errors() {
    use serde::de::Error as DeError;
    use serde::ser::Error as SerError;

    struct Opaque;

    impl serde::Serialize for Opaque {
        fn serialize<S: serde::Serializer>(&self, _s: S) -> std::result::Result<S::Ok, S::Error> {
            Err(S::Error::custom("no encoding"))
        }
    }

    impl<'de> serde::Deserialize<'de> for Opaque {
        fn deserialize<D: serde::Deserializer<'de>>(
            _d: D,
        ) -> std::result::Result<Self, D::Error> {
            Err(D::Error::custom("no decoding"))
        }
    }

    let t = setup();

    let err = build::<_, u32, _>(&t.cache, "opaque", (), |b| {
        b.subbuild("make_opaque", (), |_| Ok(Opaque)).map(|_: Opaque| 0)
    })
    .unwrap_err();

    assert!(error_kind(&err) == BuildErrorKind::Programming);
}

#[test]
fn engine_handles_repeated_builds_on_one_cache() {
    let t = setup();
    fs::write(format!("{}/a.txt", t.input), b"one").unwrap();

    let runs = AtomicUsize::new(0);
    let mut engine = Engine::new(&t.cache);

    let go = |engine: &mut Engine, runs: &AtomicUsize| -> Result<Vec<String>> {
        engine.build("crush_tree", (&t.input, &t.output), |b| {
            crush_tree(b, &t.input, &t.output, runs)
        })
    };

    go(&mut engine, &runs).unwrap();
    go(&mut engine, &runs).unwrap();
    assert!(runs.load(Ordering::SeqCst) == 1);

    fs::write(format!("{}/a.txt", t.input), b"two").unwrap();
    go(&mut engine, &runs).unwrap();
    assert!(runs.load(Ordering::SeqCst) == 2);

    engine.clean().unwrap();
    assert!(!Path::new(&format!("{}/a.txt.cr", t.output)).exists());

    go(&mut engine, &runs).unwrap();
    assert!(runs.load(Ordering::SeqCst) == 3);
    assert!(fs::read(format!("{}/a.txt.cr", t.output)).unwrap() == crush(b"two"));
}
