// SPDX-License-Identifier: MIT OR Apache-2.0

//! `mp4` subcommand: selects a time range of downloaded snapshots and
//! assembles them into an MJPEG `.mp4` file, one snapshot per frame.

use std::io::SeekFrom;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Error};
use bytes::{BufMut, BytesMut};
use chrono::{Local, NaiveDateTime};
use clap::Parser;
use tokio::fs::File;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use crate::storage;

/// Movie timebase. Divisible by every common frame rate.
const TIMESCALE: u32 = 90000;

/// Filename-form timestamp of the Unix epoch, the default range start.
const EPOCH_STAMP: &str = "1970_01_01_00_00_00";

#[derive(Parser)]
pub struct Opts {
    /// Directory of `YYYY_MM_DD_HH_MM_SS.jpg` snapshots for one camera.
    images_dir: PathBuf,

    /// Frames per second of the assembled video.
    #[arg(long, default_value = "10")]
    fps: NonZeroU32,

    /// Earliest capture time to include, `YYYY-MM-DD HH:MM`, inclusive.
    /// Defaults to the epoch.
    #[arg(long)]
    start_time: Option<String>,

    /// Latest capture time to include, `YYYY-MM-DD HH:MM`, inclusive.
    /// Defaults to now.
    #[arg(long)]
    end_time: Option<String>,

    /// Path to the `.mp4` file to write (`.mp4` appended if missing).
    out: PathBuf,
}

pub async fn run(opts: Opts) -> Result<(), Error> {
    let produced = produce_video(
        &opts.images_dir,
        opts.fps,
        opts.out,
        opts.start_time.as_deref(),
        opts.end_time.as_deref(),
    )
    .await?;
    match produced {
        Some(path) => info!("video saved to {}", path.display()),
        None => info!("no snapshots in the selected range; nothing written"),
    }
    Ok(())
}

/// Assembles every snapshot in `images_dir` whose timestamp falls within
/// `[start_time, end_time]` into `out`, in chronological order.
///
/// Returns `Ok(None)`, writing nothing, when no snapshot matches the range.
/// All selected images must share the first image's pixel dimensions.
pub async fn produce_video(
    images_dir: &Path,
    fps: NonZeroU32,
    out: PathBuf,
    start_time: Option<&str>,
    end_time: Option<&str>,
) -> Result<Option<PathBuf>, Error> {
    let start = match start_time {
        Some(s) => boundary(s)?,
        None => EPOCH_STAMP.to_owned(),
    };
    let end = match end_time {
        Some(s) => boundary(s)?,
        None => Local::now().format(storage::TIMESTAMP_FORMAT).to_string(),
    };
    let frames = select_frames(images_dir, &start, &end)?;
    if frames.is_empty() {
        return Ok(None);
    }

    let mut out = out;
    if out.extension().map_or(true, |e| e != "mp4") {
        out.as_mut_os_string().push(".mp4");
    }

    // The first frame fixes the video's dimensions; copy_frames rejects any
    // later frame that disagrees rather than resizing it.
    let dimensions = image::image_dimensions(&frames[0])
        .with_context(|| format!("unable to read image {}", frames[0].display()))?;

    // Write into a ".partial" name, renamed into place only when complete.
    let mut tmp = out.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp: PathBuf = tmp.into();
    let file = File::create(&tmp)
        .await
        .with_context(|| format!("unable to create {}", tmp.display()))?;
    let mut mp4 = Mp4Writer::new(dimensions, fps, file).await?;

    let result = async {
        copy_frames(&frames, dimensions, &mut mp4).await?;
        mp4.finish().await.context(".mp4 finish failed")
    }
    .await;
    if let Err(e) = result {
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            error!("unable to remove incomplete {}: {}", tmp.display(), e);
        }
        return Err(e);
    }
    tokio::fs::rename(&tmp, &out)
        .await
        .context("unable to move completed .mp4 into place")?;
    Ok(Some(out))
}

/// Parses a user-supplied `YYYY-MM-DD HH:MM` boundary into filename form so
/// it can be compared against snapshot name stems directly.
fn boundary(raw: &str) -> Result<String, Error> {
    let t = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .with_context(|| format!("time {raw:?} is not in YYYY-MM-DD HH:MM form"))?;
    Ok(t.format(storage::TIMESTAMP_FORMAT).to_string())
}

/// Returns the `.jpg` files whose name stems fall within `[start, end]`
/// (inclusive on both ends), sorted chronologically. Anything else in the
/// directory is ignored.
fn select_frames(dir: &Path, start: &str, end: &str) -> Result<Vec<PathBuf>, Error> {
    let mut frames = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("unable to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().map_or(true, |e| e != "jpg") {
            continue;
        }
        let in_range = matches!(
            path.file_stem().and_then(|s| s.to_str()),
            Some(stem) if start <= stem && stem <= end
        );
        if in_range {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

async fn copy_frames(
    frames: &[PathBuf],
    dimensions: (u32, u32),
    mp4: &mut Mp4Writer<File>,
) -> Result<(), Error> {
    for path in frames {
        let dims = image::image_dimensions(path)
            .with_context(|| format!("unable to read image {}", path.display()))?;
        if dims != dimensions {
            bail!(
                "{} is {}x{} but the video frame size is {}x{}",
                path.display(),
                dims.0,
                dims.1,
                dimensions.0,
                dimensions.1
            );
        }
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("unable to read {}", path.display()))?;
        mp4.add_frame(&data).await?;
    }
    Ok(())
}

/// Writes a box length for everything appended in the supplied scope.
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let _: &mut BytesMut = $buf; // type-check.
        let pos_start = ($buf as &BytesMut).len();
        let fourcc: &[u8; 4] = $fourcc;
        $buf.extend_from_slice(&[0, 0, 0, 0, fourcc[0], fourcc[1], fourcc[2], fourcc[3]]);
        let r = {
            $b;
        };
        let pos_end = ($buf as &BytesMut).len();
        let len = pos_end.checked_sub(pos_start).unwrap();
        $buf[pos_start..pos_start + 4].copy_from_slice(&u32::try_from(len)?.to_be_bytes()[..]);
        r
    }};
}

/// Writes MJPEG `.mp4` data to a sink: each sample is a complete JPEG,
/// appended to the `mdat` verbatim, with a single `jpeg` sample entry and a
/// fixed per-frame duration. Every frame is a sync sample, so no `stss` box
/// is written.
struct Mp4Writer<W: AsyncWrite + AsyncSeek + Send + Unpin> {
    mdat_start: u64,
    mdat_pos: u64,
    dimensions: (u32, u32),
    fps: NonZeroU32,

    /// Per-sample byte sizes, in presentation order.
    sizes: Vec<u32>,
    inner: W,
}

impl<W: AsyncWrite + AsyncSeek + Send + Unpin> Mp4Writer<W> {
    async fn new(dimensions: (u32, u32), fps: NonZeroU32, mut inner: W) -> Result<Self, Error> {
        let mut buf = BytesMut::new();
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(&[
                b'i', b's', b'o', b'm', // major_brand
                0, 0, 0, 0, // minor_version
                b'i', b's', b'o', b'm', // compatible_brands[0]
            ]);
        });

        let mut mdat_large_header = [0u8; 16];
        mdat_large_header[0..4].copy_from_slice(&1u32.to_be_bytes()[..]);
        mdat_large_header[4..8].copy_from_slice(b"mdat");
        buf.extend_from_slice(&mdat_large_header[..]);
        let mdat_start = u64::try_from(buf.len())?;
        inner.write_all(&buf).await?;
        Ok(Mp4Writer {
            mdat_start,
            mdat_pos: mdat_start,
            dimensions,
            fps,
            sizes: Vec::new(),
            inner,
        })
    }

    /// Appends one JPEG-encoded frame.
    async fn add_frame(&mut self, data: &[u8]) -> Result<(), Error> {
        tracing::trace!("sample {}: {} bytes", self.sizes.len() + 1, data.len());
        let size = u32::try_from(data.len())?;
        self.sizes.push(size);
        self.mdat_pos = self
            .mdat_pos
            .checked_add(u64::from(size))
            .ok_or_else(|| anyhow!("mdat_pos overflow"))?;
        self.inner.write_all(data).await?;
        Ok(())
    }

    fn frame_duration(&self) -> u32 {
        TIMESCALE / self.fps.get()
    }

    /// Writes the `moov` and patches the `mdat` length.
    async fn finish(mut self) -> Result<(), Error> {
        let samples = u32::try_from(self.sizes.len())?;
        let duration = u64::from(samples) * u64::from(self.frame_duration());
        let mut buf = BytesMut::with_capacity(1024 + 4 * self.sizes.len());
        write_box!(&mut buf, b"moov", {
            write_box!(&mut buf, b"mvhd", {
                buf.put_u32(1 << 24); // version
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(TIMESCALE);
                buf.put_u64(duration);
                buf.put_u32(0x00010000); // rate
                buf.put_u16(0x0100); // volume
                buf.put_u16(0); // reserved
                buf.put_u64(0); // reserved
                for v in &[0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                for _ in 0..6 {
                    buf.put_u32(0); // pre_defined
                }
                buf.put_u32(2); // next_track_id
            });
            self.write_video_trak(&mut buf, samples, duration)?;
        });
        self.inner.write_all(&buf).await?;
        self.inner
            .seek(SeekFrom::Start(self.mdat_start - 8))
            .await?;
        self.inner
            .write_all(&(self.mdat_pos + 16 - self.mdat_start).to_be_bytes()[..])
            .await?;
        Ok(())
    }

    fn write_video_trak(
        &self,
        buf: &mut BytesMut,
        samples: u32,
        duration: u64,
    ) -> Result<(), Error> {
        write_box!(buf, b"trak", {
            write_box!(buf, b"tkhd", {
                buf.put_u32((1 << 24) | 7); // version, flags
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(1); // track_id
                buf.put_u32(0); // reserved
                buf.put_u64(duration);
                buf.put_u64(0); // reserved
                buf.put_u16(0); // layer
                buf.put_u16(0); // alternate_group
                buf.put_u16(0); // volume
                buf.put_u16(0); // reserved
                for v in &[0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
                    buf.put_u32(*v); // matrix
                }
                let width = u32::from(u16::try_from(self.dimensions.0)?) << 16;
                let height = u32::from(u16::try_from(self.dimensions.1)?) << 16;
                buf.put_u32(width);
                buf.put_u32(height);
            });
            write_box!(buf, b"mdia", {
                write_box!(buf, b"mdhd", {
                    buf.put_u32(1 << 24); // version
                    buf.put_u64(0); // creation_time
                    buf.put_u64(0); // modification_time
                    buf.put_u32(TIMESCALE); // timebase
                    buf.put_u64(duration);
                    buf.put_u32(0x55c40000); // language=und + pre-defined
                });
                write_box!(buf, b"hdlr", {
                    buf.extend_from_slice(&[
                        0x00, 0x00, 0x00, 0x00, // version + flags
                        0x00, 0x00, 0x00, 0x00, // pre_defined
                        b'v', b'i', b'd', b'e', // handler = vide
                        0x00, 0x00, 0x00, 0x00, // reserved[0]
                        0x00, 0x00, 0x00, 0x00, // reserved[1]
                        0x00, 0x00, 0x00, 0x00, // reserved[2]
                        0x00, // name, zero-terminated (empty)
                    ]);
                });
                write_box!(buf, b"minf", {
                    write_box!(buf, b"vmhd", {
                        buf.put_u32(1);
                        buf.put_u64(0);
                    });
                    write_box!(buf, b"dinf", {
                        write_box!(buf, b"dref", {
                            buf.put_u32(0);
                            buf.put_u32(1); // entry_count
                            write_box!(buf, b"url ", {
                                buf.put_u32(1); // version, flags=self-contained
                            });
                        });
                    });
                    write_box!(buf, b"stbl", {
                        write_box!(buf, b"stsd", {
                            buf.put_u32(0); // version
                            buf.put_u32(1); // entry_count
                            self.write_video_sample_entry(buf)?;
                        });
                        write_box!(buf, b"stts", {
                            buf.put_u32(0); // version
                            buf.put_u32(1); // entry_count
                            buf.put_u32(samples);
                            buf.put_u32(self.frame_duration());
                        });
                        write_box!(buf, b"stsc", {
                            buf.put_u32(0); // version
                            buf.put_u32(1); // entry_count: one chunk holds
                            buf.put_u32(1); // every sample, consecutively.
                            buf.put_u32(samples);
                            buf.put_u32(1); // sample_description_index
                        });
                        write_box!(buf, b"stsz", {
                            buf.put_u32(0); // version
                            buf.put_u32(0); // sample_size
                            buf.put_u32(samples);
                            for s in &self.sizes {
                                buf.put_u32(*s);
                            }
                        });
                        write_box!(buf, b"co64", {
                            buf.put_u32(0); // version
                            buf.put_u32(1); // entry_count
                            buf.put_u64(self.mdat_start);
                        });
                    });
                });
            });
        });
        Ok(())
    }

    fn write_video_sample_entry(&self, buf: &mut BytesMut) -> Result<(), Error> {
        write_box!(buf, b"jpeg", {
            buf.put_u32(0);
            buf.put_u32(1); // data_reference_index = 1
            buf.extend_from_slice(&[0; 16]);
            buf.put_u16(u16::try_from(self.dimensions.0)?);
            buf.put_u16(u16::try_from(self.dimensions.1)?);
            buf.extend_from_slice(&[
                0x00, 0x48, 0x00, 0x00, // horizresolution
                0x00, 0x48, 0x00, 0x00, // vertresolution
                0x00, 0x00, 0x00, 0x00, // reserved
                0x00, 0x01, // frame count
                0x00, 0x00, 0x00, 0x00, // compressorname
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x18, 0xff, 0xff, // depth + pre_defined
            ]);
        });
        Ok(())
    }
}
