/*
 * Copyright (C) 2024 The rlat authors
 *
 * This file is part of rlat.
 *
 * rlat is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * rlat is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with rlat.  If not, see <https://www.gnu.org/licenses/>.
 */

pub mod cancel;
pub mod cpu_affinity;
