#![allow(unused_imports)]

pub(crate) use crate::error::Error;
pub(crate) use crate::{early_fake_ok, format_dbg};
pub(crate) use crate::lin_search_hint::*;
pub(crate) use crate::si;
pub(crate) use crate::traits::*;
pub(crate) use crate::uc;
pub(crate) use crate::utils;
pub(crate) use crate::utils::{almost_eq, almost_eq_uom, secs, sign};
pub(crate) use crate::validate::*;
pub(crate) use anyhow::{anyhow, bail, ensure, Context};
pub(crate) use derive_more::{From, IsVariant};
pub(crate) use duplicate::duplicate_item;
pub(crate) use serde::{Deserialize, Serialize};
pub(crate) use std::cmp::{self, Ordering};
pub(crate) use std::collections::{HashMap, VecDeque};
pub(crate) use std::ffi::OsStr;
pub(crate) use std::fmt;
pub(crate) use std::fs::File;
pub(crate) use std::num::{NonZeroU16, NonZeroUsize};
pub(crate) use std::path::{Path, PathBuf};
pub(crate) use uom::ConstZero;
